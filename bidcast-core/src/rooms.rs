//! Live-room pool and endpoint allocation.
//!
//! A fixed set of rooms is declared in configuration. Each room owns a fixed
//! set of publish endpoints and hosts at most one project at a time; an
//! endpoint is bound to at most one active publisher. All mutation goes
//! through [`RoomPool`] under a single writer lock.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::info;

use crate::config::RoomsConfig;
use crate::error::{Error, Result};
use crate::replay::Replay;

/// Project id value meaning "no project bound".
pub const UNBOUND_PROJECT: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UserType {
    Bidder = 0,
    Holder = 1,
    Machine = 2,
}

impl TryFrom<u8> for UserType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bidder),
            1 => Ok(Self::Holder),
            2 => Ok(Self::Machine),
            other => Err(format!("invalid user type {other}")),
        }
    }
}

impl From<UserType> for u8 {
    fn from(value: UserType) -> Self {
        value as Self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VideoType {
    Camera = 0,
    PcCamera = 1,
    DesktopShare = 2,
}

impl TryFrom<u8> for VideoType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Camera),
            1 => Ok(Self::PcCamera),
            2 => Ok(Self::DesktopShare),
            other => Err(format!("invalid video type {other}")),
        }
    }
}

impl From<VideoType> for u8 {
    fn from(value: VideoType) -> Self {
        value as Self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EndpointState {
    #[default]
    Free = 0,
    Busy = 1,
}

impl TryFrom<u8> for EndpointState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Busy),
            other => Err(format!("invalid endpoint state {other}")),
        }
    }
}

impl From<EndpointState> for u8 {
    fn from(value: EndpointState) -> Self {
        value as Self
    }
}

/// A publish slot within a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "pushId")]
    pub push_id: i32,
    #[serde(rename = "userType")]
    pub user_type: UserType,
    #[serde(rename = "videoType")]
    pub video_type: VideoType,
    #[serde(rename = "base")]
    pub base_url: String,
    #[serde(rename = "savePath")]
    pub save_path: String,
    #[serde(rename = "videoName")]
    pub video_name: String,
    #[serde(rename = "saveUrl")]
    pub save_url: String,
    #[serde(rename = "requestUrl")]
    pub request_url: String,
    pub state: EndpointState,
    #[serde(rename = "url")]
    pub push_url: String,
    #[serde(rename = "limitAudio")]
    pub limit_audio: bool,
    #[serde(default)]
    pub replays: Vec<Replay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "liveRoomId")]
    pub room_id: String,
    #[serde(rename = "projectId")]
    pub project_id: i64,
    #[serde(rename = "urls")]
    pub endpoints: Vec<Endpoint>,
}

/// Snapshot of an endpoint matched by its push URL, plus the owning room.
#[derive(Debug, Clone)]
pub struct EndpointRef {
    pub room_id: String,
    pub project_id: i64,
    pub endpoint: Endpoint,
}

/// What `stop_project` tore down, for connection close and webhook fan-out.
#[derive(Debug, Clone)]
pub struct StoppedProject {
    pub room_id: String,
    /// Push URLs that were Busy and are now cleared.
    pub closed_urls: Vec<String>,
    /// `(push_id, request_url)` of every Camera endpoint in the room.
    pub camera_webhooks: Vec<(i32, String)>,
}

/// The room pool. Single writer at a time; reads take the shared lock.
pub struct RoomPool {
    rooms: RwLock<Vec<Room>>,
}

impl RoomPool {
    #[must_use]
    pub fn new(config: &RoomsConfig) -> Self {
        let rooms = config
            .rooms
            .iter()
            .map(|decl| Room {
                room_id: decl.room_id.clone(),
                project_id: UNBOUND_PROJECT,
                endpoints: decl
                    .endpoints
                    .iter()
                    .map(|e| Endpoint {
                        push_id: e.push_id,
                        user_type: e.user_type,
                        video_type: e.video_type,
                        base_url: e.base_url.clone(),
                        save_path: e.save_path.clone(),
                        video_name: e.video_name.clone(),
                        save_url: e.save_url.clone(),
                        request_url: e.request_url.clone(),
                        state: EndpointState::Free,
                        push_url: String::new(),
                        limit_audio: false,
                        replays: Vec::new(),
                    })
                    .collect(),
            })
            .collect();
        info!("room pool initialized");
        Self {
            rooms: RwLock::new(rooms),
        }
    }

    pub fn project_exists(&self, project_id: i64) -> bool {
        let rooms = self.rooms.read().unwrap();
        rooms.iter().any(|r| r.project_id == project_id)
    }

    pub fn room_of_project(&self, project_id: i64) -> Result<String> {
        let rooms = self.rooms.read().unwrap();
        rooms
            .iter()
            .find(|r| r.project_id == project_id)
            .map(|r| r.room_id.clone())
            .ok_or_else(|| Error::NotFound("Live Room".to_string()))
    }

    pub fn pool_full(&self) -> bool {
        let rooms = self.rooms.read().unwrap();
        rooms.iter().all(|r| r.project_id != UNBOUND_PROJECT)
    }

    /// First unbound room id. Binding happens later in [`Self::set_start`].
    pub fn alloc_room(&self) -> Result<String> {
        let rooms = self.rooms.read().unwrap();
        rooms
            .iter()
            .find(|r| r.project_id == UNBOUND_PROJECT)
            .map(|r| r.room_id.clone())
            .ok_or(Error::RoomPoolFull)
    }

    /// True iff every endpoint of `user_type` in the room is Busy (or the
    /// room has no endpoint of that type at all).
    pub fn push_user_full(&self, room_id: &str, user_type: UserType) -> bool {
        let rooms = self.rooms.read().unwrap();
        !rooms.iter().any(|r| {
            r.room_id == room_id
                && r.endpoints
                    .iter()
                    .any(|e| e.state == EndpointState::Free && e.user_type == user_type)
        })
    }

    /// First Free endpoint of the requested user type: `(push_id, base_url)`.
    pub fn next_free_endpoint(&self, room_id: &str, user_type: UserType) -> Result<(i32, String)> {
        let rooms = self.rooms.read().unwrap();
        rooms
            .iter()
            .filter(|r| r.room_id == room_id)
            .flat_map(|r| r.endpoints.iter())
            .find(|e| e.state == EndpointState::Free && e.user_type == user_type)
            .map(|e| (e.push_id, e.base_url.clone()))
            .ok_or(Error::UserTypeFull)
    }

    /// Mark the endpoint Busy with `push_url` and bind the room's project.
    pub fn set_start(
        &self,
        project_id: i64,
        room_id: &str,
        push_id: i32,
        push_url: &str,
    ) -> Result<()> {
        let mut rooms = self.rooms.write().unwrap();
        let room = rooms
            .iter_mut()
            .find(|r| r.room_id == room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        room.project_id = project_id;
        let endpoint = room
            .endpoints
            .iter_mut()
            .find(|e| e.push_id == push_id)
            .ok_or_else(|| Error::NotFound(format!("push id {push_id} in room {room_id}")))?;
        endpoint.push_url = push_url.to_string();
        endpoint.state = EndpointState::Busy;
        Ok(())
    }

    /// Busy endpoint matching `push_url`. Publisher admission goes through
    /// this lookup: a URL without a Busy endpoint was never allocated.
    pub fn endpoint_by_url(&self, push_url: &str) -> Result<EndpointRef> {
        let rooms = self.rooms.read().unwrap();
        for room in rooms.iter() {
            for endpoint in &room.endpoints {
                if endpoint.push_url == push_url && endpoint.state == EndpointState::Busy {
                    return Ok(EndpointRef {
                        room_id: room.room_id.clone(),
                        project_id: room.project_id,
                        endpoint: endpoint.clone(),
                    });
                }
            }
        }
        Err(Error::NotFound("PushStream".to_string()))
    }

    /// Busy endpoint whose push URL *path* (everything after `host:port`)
    /// equals `path`. RTMP negotiation yields app name and stream key but
    /// not the host the client dialed, so admission matches on the path.
    pub fn endpoint_by_path(&self, path: &str) -> Result<EndpointRef> {
        let rooms = self.rooms.read().unwrap();
        for room in rooms.iter() {
            for endpoint in &room.endpoints {
                if endpoint.state == EndpointState::Busy && url_path(&endpoint.push_url) == path {
                    return Ok(EndpointRef {
                        room_id: room.room_id.clone(),
                        project_id: room.project_id,
                        endpoint: endpoint.clone(),
                    });
                }
            }
        }
        Err(Error::NotFound("PushStream".to_string()))
    }

    /// `(room_id, push_id)` for a push URL, regardless of endpoint state.
    pub fn ids_by_url(&self, push_url: &str) -> Result<(String, i32)> {
        let rooms = self.rooms.read().unwrap();
        for room in rooms.iter() {
            for endpoint in &room.endpoints {
                if endpoint.push_url == push_url {
                    return Ok((room.room_id.clone(), endpoint.push_id));
                }
            }
        }
        Err(Error::NotFound("PushUrl".to_string()))
    }

    /// `(project_id, push_id)` for a push URL.
    pub fn project_push_by_url(&self, push_url: &str) -> Result<(i64, i32)> {
        let rooms = self.rooms.read().unwrap();
        for room in rooms.iter() {
            for endpoint in &room.endpoints {
                if endpoint.push_url == push_url {
                    return Ok((room.project_id, endpoint.push_id));
                }
            }
        }
        Err(Error::NotFound("PushUrl".to_string()))
    }

    pub fn set_limit_audio(&self, project_id: i64, push_id: i32, limit: bool) -> Result<()> {
        let mut rooms = self.rooms.write().unwrap();
        for room in rooms.iter_mut() {
            if room.project_id != project_id {
                continue;
            }
            for endpoint in &mut room.endpoints {
                if endpoint.push_id == push_id && endpoint.state == EndpointState::Busy {
                    endpoint.limit_audio = limit;
                    return Ok(());
                }
            }
        }
        Err(Error::NotFound("SetLimitAudio".to_string()))
    }

    pub fn set_limit_audio_by_url(&self, push_url: &str, limit: bool) -> Result<()> {
        let mut rooms = self.rooms.write().unwrap();
        for room in rooms.iter_mut() {
            for endpoint in &mut room.endpoints {
                if endpoint.push_url == push_url && endpoint.state == EndpointState::Busy {
                    endpoint.limit_audio = limit;
                    return Ok(());
                }
            }
        }
        Err(Error::NotFound("SetLimitAudio".to_string()))
    }

    pub fn limit_audio(&self, project_id: i64, push_id: i32) -> Result<bool> {
        let rooms = self.rooms.read().unwrap();
        for room in rooms.iter() {
            if room.project_id != project_id {
                continue;
            }
            for endpoint in &room.endpoints {
                if endpoint.push_id == push_id {
                    return Ok(endpoint.limit_audio);
                }
            }
        }
        Err(Error::NotFound("PushId".to_string()))
    }

    /// Clear every Busy endpoint of the project's room and unbind it.
    pub fn stop_project(&self, project_id: i64) -> Result<StoppedProject> {
        let mut rooms = self.rooms.write().unwrap();
        let room = rooms
            .iter_mut()
            .find(|r| r.project_id == project_id)
            .ok_or_else(|| Error::NotFound("ProjectId".to_string()))?;

        let camera_webhooks = room
            .endpoints
            .iter()
            .filter(|e| e.video_type == VideoType::Camera)
            .map(|e| (e.push_id, e.request_url.clone()))
            .collect();

        let mut closed_urls = Vec::new();
        for endpoint in &mut room.endpoints {
            if endpoint.state == EndpointState::Busy {
                closed_urls.push(std::mem::take(&mut endpoint.push_url));
                endpoint.state = EndpointState::Free;
                endpoint.limit_audio = false;
            }
        }
        room.project_id = UNBOUND_PROJECT;

        Ok(StoppedProject {
            room_id: room.room_id.clone(),
            closed_urls,
            camera_webhooks,
        })
    }

    /// Deep copy of the whole pool, for listings.
    pub fn snapshot(&self) -> Vec<Room> {
        self.rooms.read().unwrap().clone()
    }

    /// Deep copy of the room bound to `project_id`.
    pub fn snapshot_of_project(&self, project_id: i64) -> Result<Room> {
        let rooms = self.rooms.read().unwrap();
        rooms
            .iter()
            .find(|r| r.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound("ProjectId".to_string()))
    }
}

/// The path part of an RTMP URL: everything after `scheme://host[:port]/`.
fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split_once('/').map_or("", |(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointDecl, RoomDecl};

    fn endpoint_decl(push_id: i32, user_type: UserType, video_type: VideoType) -> EndpointDecl {
        EndpointDecl {
            push_id,
            user_type,
            video_type,
            base_url: "rtmp://h".to_string(),
            save_path: "/data/rec".to_string(),
            video_name: "Camera".to_string(),
            save_url: "http://h/replay".to_string(),
            request_url: "http://h/notify".to_string(),
        }
    }

    fn two_room_pool() -> RoomPool {
        RoomPool::new(&RoomsConfig {
            rooms: vec![
                RoomDecl {
                    room_id: "R1".to_string(),
                    endpoints: vec![
                        endpoint_decl(1, UserType::Bidder, VideoType::Camera),
                        endpoint_decl(2, UserType::Holder, VideoType::Camera),
                    ],
                },
                RoomDecl {
                    room_id: "R2".to_string(),
                    endpoints: vec![endpoint_decl(1, UserType::Bidder, VideoType::Camera)],
                },
            ],
        })
    }

    #[test]
    fn alloc_and_bind() {
        let pool = two_room_pool();
        assert!(!pool.project_exists(12));
        assert!(!pool.pool_full());

        let room_id = pool.alloc_room().unwrap();
        assert_eq!(room_id, "R1");

        let (push_id, base) = pool.next_free_endpoint(&room_id, UserType::Bidder).unwrap();
        assert_eq!(push_id, 1);
        assert_eq!(base, "rtmp://h");

        pool.set_start(12, &room_id, push_id, "rtmp://h:1935/live/R1/20240101/12/Camera_1")
            .unwrap();
        assert!(pool.project_exists(12));
        assert_eq!(pool.room_of_project(12).unwrap(), "R1");

        // The same URL now admits a publisher.
        let found = pool
            .endpoint_by_url("rtmp://h:1935/live/R1/20240101/12/Camera_1")
            .unwrap();
        assert_eq!(found.room_id, "R1");
        assert_eq!(found.project_id, 12);
        assert_eq!(found.endpoint.push_id, 1);

        // Admission by URL path, as seen after RTMP negotiation.
        let by_path = pool
            .endpoint_by_path("live/R1/20240101/12/Camera_1")
            .unwrap();
        assert_eq!(by_path.endpoint.push_id, 1);
        assert!(pool.endpoint_by_path("live/R1/20240101/12/Camera_9").is_err());

        // Reverse lookups used for stream back-references.
        assert_eq!(
            pool.ids_by_url("rtmp://h:1935/live/R1/20240101/12/Camera_1")
                .unwrap(),
            ("R1".to_string(), 1)
        );
        assert_eq!(
            pool.project_push_by_url("rtmp://h:1935/live/R1/20240101/12/Camera_1")
                .unwrap(),
            (12, 1)
        );
    }

    #[test]
    fn projects_bind_distinct_rooms() {
        let pool = two_room_pool();
        let r1 = pool.alloc_room().unwrap();
        pool.set_start(12, &r1, 1, "rtmp://h/a").unwrap();
        let r2 = pool.alloc_room().unwrap();
        assert_ne!(r1, r2);
        pool.set_start(13, &r2, 1, "rtmp://h/b").unwrap();

        // No two bound rooms share a project id.
        let snapshot = pool.snapshot();
        let bound: Vec<i64> = snapshot
            .iter()
            .map(|r| r.project_id)
            .filter(|p| *p != UNBOUND_PROJECT)
            .collect();
        assert_eq!(bound.len(), 2);
        assert_ne!(bound[0], bound[1]);

        assert!(pool.pool_full());
        assert!(matches!(pool.alloc_room(), Err(Error::RoomPoolFull)));
    }

    #[test]
    fn user_type_capacity() {
        let pool = two_room_pool();
        assert!(!pool.push_user_full("R1", UserType::Bidder));
        assert!(pool.push_user_full("R1", UserType::Machine));

        pool.set_start(12, "R1", 1, "rtmp://h/a").unwrap();
        assert!(pool.push_user_full("R1", UserType::Bidder));
        assert!(!pool.push_user_full("R1", UserType::Holder));
        assert!(matches!(
            pool.next_free_endpoint("R1", UserType::Bidder),
            Err(Error::UserTypeFull)
        ));
    }

    #[test]
    fn mute_toggles_only_busy_endpoints() {
        let pool = two_room_pool();
        pool.set_start(12, "R1", 1, "rtmp://h/a").unwrap();

        assert!(matches!(
            pool.set_limit_audio(12, 2, true),
            Err(Error::NotFound(_))
        ));

        pool.set_limit_audio(12, 1, true).unwrap();
        assert!(pool.limit_audio(12, 1).unwrap());
        pool.set_limit_audio_by_url("rtmp://h/a", false).unwrap();
        assert!(!pool.limit_audio(12, 1).unwrap());
    }

    #[test]
    fn stop_project_clears_and_is_observable_once() {
        let pool = two_room_pool();
        pool.set_start(12, "R1", 1, "rtmp://h/a").unwrap();
        pool.set_limit_audio(12, 1, true).unwrap();

        let stopped = pool.stop_project(12).unwrap();
        assert_eq!(stopped.room_id, "R1");
        assert_eq!(stopped.closed_urls, vec!["rtmp://h/a".to_string()]);
        assert_eq!(stopped.camera_webhooks.len(), 2);

        assert!(!pool.project_exists(12));
        assert!(matches!(
            pool.endpoint_by_url("rtmp://h/a"),
            Err(Error::NotFound(_))
        ));

        // Second stop finds nothing and changes nothing.
        assert!(matches!(pool.stop_project(12), Err(Error::NotFound(_))));
        let snapshot = pool.snapshot();
        assert!(snapshot
            .iter()
            .flat_map(|r| r.endpoints.iter())
            .all(|e| e.state == EndpointState::Free && e.push_url.is_empty() && !e.limit_audio));
    }

    #[test]
    fn busy_urls_are_unique() {
        let pool = two_room_pool();
        pool.set_start(12, "R1", 1, "rtmp://h/a").unwrap();
        pool.set_start(12, "R1", 2, "rtmp://h/b").unwrap();

        let snapshot = pool.snapshot();
        let mut urls: Vec<&str> = snapshot
            .iter()
            .flat_map(|r| r.endpoints.iter())
            .filter(|e| e.state == EndpointState::Busy)
            .map(|e| e.push_url.as_str())
            .collect();
        urls.sort_unstable();
        let len_before = urls.len();
        urls.dedup();
        assert_eq!(urls.len(), len_before);
    }
}
