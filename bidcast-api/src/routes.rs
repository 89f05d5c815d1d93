//! HTTP control surface.
//!
//! All endpoints are GET with query-string parameters and JSON responses,
//! CORS wide open. Success is HTTP 200; application errors come back as 601
//! with `{result, message}`.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use bidcast_core::replay::{Replay, ReplayIndex};
use bidcast_core::rooms::{Endpoint, Room, UserType, VideoType};
use bidcast_livestream::ServerContext;

use crate::error::{ApiError, ApiResult};
use crate::webhook::WebhookNotifier;

const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Clone)]
pub struct ApiState {
    pub ctx: ServerContext,
    pub webhooks: WebhookNotifier,
}

impl ApiState {
    #[must_use]
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            webhooks: WebhookNotifier::new(),
        }
    }
}

#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/getPush", get(get_push))
        .route("/stopProject", get(stop_project))
        .route("/getCurrentList", get(get_current_list))
        .route("/getReplay", get(get_replay))
        .route("/setPushIdAudio", get(set_push_audio))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    #[serde(rename = "liveRoomId")]
    pub live_room_id: String,
    #[serde(rename = "pushId")]
    pub push_id: i32,
    #[serde(rename = "pushUrl")]
    pub push_url: String,
    #[serde(rename = "userType")]
    pub user_type: UserType,
    #[serde(rename = "projectId")]
    pub project_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CurrentList {
    #[serde(rename = "lives")]
    pub rooms: Vec<Room>,
}

#[derive(Debug, Serialize)]
pub struct ReplayRooms {
    #[serde(rename = "replays")]
    pub rooms: Vec<ReplayRoom>,
}

#[derive(Debug, Serialize)]
pub struct ReplayRoom {
    #[serde(rename = "liveRoomId")]
    pub room_id: String,
    #[serde(rename = "urls")]
    pub endpoints: Vec<ReplayEndpoint>,
}

#[derive(Debug, Serialize)]
pub struct ReplayEndpoint {
    #[serde(rename = "pushId")]
    pub push_id: i32,
    pub replays: Vec<Replay>,
}

/// Allocate a publish endpoint for a project.
///
/// `GET /getPush?projectId=<int>&userType=<0|1|2>`
pub async fn get_push(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<PushResponse>> {
    let project_id = parse_param(&params, "projectId")?;
    let user_type_raw: i64 = parse_param(&params, "userType")?;
    let user_type = u8::try_from(user_type_raw)
        .ok()
        .and_then(|v| UserType::try_from(v).ok())
        .ok_or_else(|| {
            ApiError::new("Get Push Failed Live Room User Full Or UserType Not Found")
        })?;

    let rooms = &state.ctx.rooms;
    let mut new_project = false;
    let room_id = if rooms.project_exists(project_id) {
        rooms
            .room_of_project(project_id)
            .map_err(|_| ApiError::new("Get Push Failed Not Found ProjectId"))?
    } else {
        if rooms.pool_full() {
            return Err(ApiError::new("Get Push Failed Live Room Full"));
        }
        let room_id = rooms
            .alloc_room()
            .map_err(|_| ApiError::new("Get Push Failed Alloc Live Room Failed"))?;
        new_project = true;
        room_id
    };

    if rooms.push_user_full(&room_id, user_type) {
        return Err(ApiError::new(
            "Get Push Failed Live Room User Full Or UserType Not Found",
        ));
    }
    let (push_id, base_url) = rooms
        .next_free_endpoint(&room_id, user_type)
        .map_err(|_| ApiError::new("Get Push Failed GetPushId Failed"))?;

    let listen_port = state.ctx.config.server.rtmp_port;
    let date = if state.ctx.config.server.static_addr {
        None
    } else {
        Some(Local::now().format(DATE_FORMAT).to_string())
    };
    let push_url = build_push_url(
        &base_url,
        listen_port,
        &room_id,
        date.as_deref(),
        project_id,
        push_id,
    );

    info!(%room_id, push_id, %push_url, "allocated publish endpoint");
    rooms
        .set_start(project_id, &room_id, push_id, &push_url)
        .map_err(ApiError::from)?;

    if new_project {
        let room = rooms
            .snapshot_of_project(project_id)
            .map_err(|_| ApiError::new("Stop Project Failed Not Found ProjectId"))?;
        for endpoint in room
            .endpoints
            .iter()
            .filter(|e| e.video_type == VideoType::Camera)
        {
            // Start notifications always carry the date-less URL.
            let notify_url = build_push_url(
                &endpoint.base_url,
                listen_port,
                &room_id,
                None,
                project_id,
                endpoint.push_id,
            );
            state
                .webhooks
                .notify_start(&endpoint.request_url, &room_id, &notify_url)
                .await;
        }
    }

    Ok(Json(PushResponse {
        live_room_id: room_id,
        push_id,
        push_url,
        user_type,
        project_id,
    }))
}

/// Stop every endpoint of a project's room and unbind it.
///
/// `GET /stopProject?projectId=<int>`
pub async fn stop_project(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let project_id = parse_param(&params, "projectId")?;

    // One atomic teardown; it hands back the webhook targets and the URLs
    // whose connections still need closing.
    let stopped = state
        .ctx
        .rooms
        .stop_project(project_id)
        .map_err(|_| ApiError::new("Stop Project Failed Not Found ProjectId"))?;

    for (push_id, request_url) in &stopped.camera_webhooks {
        state
            .webhooks
            .notify_stop(request_url, &stopped.room_id, *push_id)
            .await;
    }

    state
        .ctx
        .registry
        .close_streams_for_urls(&stopped.closed_urls);

    info!(project_id, room_id = %stopped.room_id, "project stopped");
    Ok(Json(json!({
        "result": 0,
        "message": "Stop Project Success",
    })))
}

/// The room tree with per-endpoint replay listings.
///
/// `GET /getCurrentList[?projectId=<int>]`
pub async fn get_current_list(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<CurrentList>> {
    let mut rooms = match params.get("projectId") {
        None => state.ctx.rooms.snapshot(),
        Some(_) => {
            let project_id = parse_param(&params, "projectId")?;
            state
                .ctx
                .rooms
                .snapshot()
                .into_iter()
                .filter(|r| r.project_id == project_id)
                .collect()
        }
    };

    for room in &mut rooms {
        let room_id = room.room_id.clone();
        let project_id = room.project_id;
        for endpoint in &mut room.endpoints {
            endpoint.replays =
                endpoint_replays(&state.ctx.replay, endpoint, &room_id, project_id).await?;
        }
    }

    Ok(Json(CurrentList { rooms }))
}

/// Rooms holding recordings for a project.
///
/// `GET /getReplay?projectId=<int>`
pub async fn get_replay(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<ReplayRooms>> {
    let project_id = parse_param(&params, "projectId")?;

    let mut out = Vec::new();
    for room in state.ctx.rooms.snapshot() {
        let mut endpoints = Vec::new();
        for endpoint in &room.endpoints {
            let dir = recording_dir(endpoint, &room.room_id, project_id);
            if !dir.is_dir() {
                continue;
            }
            let replays =
                endpoint_replays(&state.ctx.replay, endpoint, &room.room_id, project_id).await?;
            endpoints.push(ReplayEndpoint {
                push_id: endpoint.push_id,
                replays,
            });
        }
        if !endpoints.is_empty() {
            out.push(ReplayRoom {
                room_id: room.room_id.clone(),
                endpoints,
            });
        }
    }

    Ok(Json(ReplayRooms { rooms: out }))
}

/// Toggle per-publisher audio muting: `audio=0` mutes, anything else
/// unmutes.
///
/// `GET /setPushIdAudio?projectId=<int>&pushId=<int>&audio=<0|1>`
pub async fn set_push_audio(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let project_id = parse_param(&params, "projectId")?;
    let push_id: i64 = parse_param(&params, "pushId")?;
    let push_id =
        i32::try_from(push_id).map_err(|_| ApiError::new("pushId Param error, please check them"))?;
    let audio: i64 = parse_param(&params, "audio")?;

    state
        .ctx
        .rooms
        .set_limit_audio(project_id, push_id, audio == 0)
        .map_err(ApiError::from)?;

    let message = format!("set Audio Success ProjectId:{project_id} pushId={push_id} Audio={audio}");
    info!(%message, "audio limit updated");
    Ok(Json(json!({
        "result": 200,
        "message": message,
    })))
}

fn parse_param(params: &HashMap<String, String>, name: &str) -> ApiResult<i64> {
    params
        .get(name)
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| ApiError::new(format!("{name} Param error, please check them")))
}

/// `<base>:<port>/live/<room>[/<date>]/<project>/Camera_<push>`
fn build_push_url(
    base_url: &str,
    port: u16,
    room_id: &str,
    date: Option<&str>,
    project_id: i64,
    push_id: i32,
) -> String {
    match date {
        Some(date) => {
            format!("{base_url}:{port}/live/{room_id}/{date}/{project_id}/Camera_{push_id}")
        }
        None => format!("{base_url}:{port}/live/{room_id}/{project_id}/Camera_{push_id}"),
    }
}

fn recording_dir(endpoint: &Endpoint, room_id: &str, project_id: i64) -> PathBuf {
    PathBuf::from(&endpoint.save_path)
        .join(room_id)
        .join(project_id.to_string())
}

/// Scan an endpoint's recording directory and publish each file under its
/// replay address.
async fn endpoint_replays(
    index: &Arc<ReplayIndex>,
    endpoint: &Endpoint,
    room_id: &str,
    project_id: i64,
) -> ApiResult<Vec<Replay>> {
    let dir = recording_dir(endpoint, room_id, project_id);
    let scan_index = index.clone();
    let scanned = tokio::task::spawn_blocking(move || scan_index.scan_dir(&dir))
        .await
        .map_err(|_| ApiError::new("Get Rtmp List Failed"))?
        .map_err(|_| ApiError::new("Get Rtmp List Failed"))?;

    Ok(scanned
        .into_iter()
        .map(|file| Replay {
            addr: format!(
                "{}/{}/{}/{}",
                endpoint.save_url, room_id, project_id, file.name
            ),
            size: file.size,
            md5: file.md5,
            start: file.start,
            finish: file.finish,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidcast_core::config::{Config, EndpointDecl, RoomDecl, RoomsConfig};
    use bidcast_core::rooms::RoomPool;
    use bidcast_livestream::relay::{NullRelaySink, RelayRegistry};
    use bidcast_livestream::StreamRegistry;
    use tempfile::TempDir;

    struct TestHarness {
        state: ApiState,
        _dir: TempDir,
        save_path: PathBuf,
    }

    fn harness() -> TestHarness {
        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("rec");

        let rooms_config = RoomsConfig {
            rooms: vec![
                RoomDecl {
                    room_id: "R1".to_string(),
                    endpoints: vec![
                        EndpointDecl {
                            push_id: 1,
                            user_type: UserType::Bidder,
                            video_type: VideoType::Camera,
                            base_url: "rtmp://h".to_string(),
                            save_path: save_path.to_string_lossy().into_owned(),
                            video_name: "Camera".to_string(),
                            save_url: "http://h/replay".to_string(),
                            request_url: String::new(),
                        },
                        EndpointDecl {
                            push_id: 2,
                            user_type: UserType::Holder,
                            video_type: VideoType::Camera,
                            base_url: "rtmp://h".to_string(),
                            save_path: save_path.to_string_lossy().into_owned(),
                            video_name: "Camera".to_string(),
                            save_url: "http://h/replay".to_string(),
                            request_url: String::new(),
                        },
                    ],
                },
                RoomDecl {
                    room_id: "R2".to_string(),
                    endpoints: vec![EndpointDecl {
                        push_id: 1,
                        user_type: UserType::Bidder,
                        video_type: VideoType::Camera,
                        base_url: "rtmp://h".to_string(),
                        save_path: save_path.to_string_lossy().into_owned(),
                        video_name: "Camera".to_string(),
                        save_url: "http://h/replay".to_string(),
                        request_url: String::new(),
                    }],
                },
            ],
        };

        let config = Arc::new(Config::default());
        let rooms = Arc::new(RoomPool::new(&rooms_config));
        let replay = Arc::new(ReplayIndex::load(dir.path().join("replay.json")));
        let relay = Arc::new(RelayRegistry::new(
            config.relay.clone(),
            Arc::new(NullRelaySink),
        ));
        let registry = StreamRegistry::new(
            config.clone(),
            rooms.clone(),
            relay.clone(),
            replay.clone(),
        );
        let ctx = ServerContext::new(config, rooms, replay, relay, registry);

        TestHarness {
            state: ApiState::new(ctx),
            _dir: dir,
            save_path,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Query<HashMap<String, String>> {
        Query(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn allocate_returns_dated_push_url() {
        let h = harness();
        let response = get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();

        let date = Local::now().format(DATE_FORMAT).to_string();
        assert_eq!(response.0.live_room_id, "R1");
        assert_eq!(response.0.push_id, 1);
        assert_eq!(
            response.0.push_url,
            format!("rtmp://h:1935/live/R1/{date}/12/Camera_1")
        );
        assert!(h.state.ctx.rooms.project_exists(12));

        // The allocated endpoint now admits a publisher by URL path.
        let path = format!("live/R1/{date}/12/Camera_1");
        assert!(h.state.ctx.rooms.endpoint_by_path(&path).is_ok());
    }

    #[tokio::test]
    async fn same_project_reuses_its_room() {
        let h = harness();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();
        let second = get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "1")]),
        )
        .await
        .unwrap();
        assert_eq!(second.0.live_room_id, "R1");
        assert_eq!(second.0.push_id, 2);
    }

    #[tokio::test]
    async fn room_pool_exhaustion_is_reported() {
        let h = harness();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "13"), ("userType", "0")]),
        )
        .await
        .unwrap();

        let err = get_push(
            State(h.state.clone()),
            params(&[("projectId", "99"), ("userType", "0")]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "Get Push Failed Live Room Full");
    }

    #[tokio::test]
    async fn user_type_exhaustion_is_reported() {
        let h = harness();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();

        let err = get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.message,
            "Get Push Failed Live Room User Full Or UserType Not Found"
        );
    }

    #[tokio::test]
    async fn bad_parameters_are_601() {
        let h = harness();
        let err = get_push(
            State(h.state.clone()),
            params(&[("projectId", "abc"), ("userType", "0")]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "projectId Param error, please check them");
    }

    #[tokio::test]
    async fn stop_project_clears_state_and_is_not_repeatable() {
        let h = harness();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();

        let response = stop_project(State(h.state.clone()), params(&[("projectId", "12")]))
            .await
            .unwrap();
        assert_eq!(response.0["result"], 0);
        assert_eq!(response.0["message"], "Stop Project Success");
        assert!(!h.state.ctx.rooms.project_exists(12));

        let err = stop_project(State(h.state.clone()), params(&[("projectId", "12")]))
            .await
            .unwrap_err();
        assert_eq!(err.message, "Stop Project Failed Not Found ProjectId");
    }

    #[tokio::test]
    async fn audio_toggle_round_trip() {
        let h = harness();
        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();

        set_push_audio(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("pushId", "1"), ("audio", "0")]),
        )
        .await
        .unwrap();
        assert!(h.state.ctx.rooms.limit_audio(12, 1).unwrap());

        set_push_audio(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("pushId", "1"), ("audio", "1")]),
        )
        .await
        .unwrap();
        assert!(!h.state.ctx.rooms.limit_audio(12, 1).unwrap());

        let err = set_push_audio(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("pushId", "9"), ("audio", "0")]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "Not found: SetLimitAudio");
    }

    #[tokio::test]
    async fn current_list_carries_replays() {
        let h = harness();
        let rec_dir = h.save_path.join("R1").join("12");
        std::fs::create_dir_all(&rec_dir).unwrap();
        std::fs::write(
            rec_dir.join("Camera_20240101T010203_20240101T020304.ts"),
            b"recorded",
        )
        .unwrap();

        get_push(
            State(h.state.clone()),
            params(&[("projectId", "12"), ("userType", "0")]),
        )
        .await
        .unwrap();

        let list = get_current_list(State(h.state.clone()), params(&[("projectId", "12")]))
            .await
            .unwrap();
        assert_eq!(list.0.rooms.len(), 1);
        let endpoint = &list.0.rooms[0].endpoints[0];
        assert_eq!(endpoint.replays.len(), 1);
        let replay = &endpoint.replays[0];
        assert_eq!(
            replay.addr,
            "http://h/replay/R1/12/Camera_20240101T010203_20240101T020304.ts"
        );
        assert_eq!(replay.size, 8);
        assert_eq!(replay.md5, format!("{:x}", md5::compute(b"recorded")));
        assert_eq!(replay.start, "20240101T010203");
        assert_eq!(replay.finish, "20240101T020304");
    }

    #[tokio::test]
    async fn replay_listing_filters_by_recordings_on_disk() {
        let h = harness();
        let rec_dir = h.save_path.join("R1").join("12");
        std::fs::create_dir_all(&rec_dir).unwrap();
        std::fs::write(rec_dir.join("Camera_20240101T010203.ts"), b"x").unwrap();

        let listing = get_replay(State(h.state.clone()), params(&[("projectId", "12")]))
            .await
            .unwrap();
        assert_eq!(listing.0.rooms.len(), 1);
        assert_eq!(listing.0.rooms[0].room_id, "R1");

        let empty = get_replay(State(h.state.clone()), params(&[("projectId", "77")]))
            .await
            .unwrap();
        assert!(empty.0.rooms.is_empty());
    }

    #[test]
    fn push_url_shapes() {
        assert_eq!(
            build_push_url("rtmp://h", 1935, "R1", Some("20240101"), 12, 1),
            "rtmp://h:1935/live/R1/20240101/12/Camera_1"
        );
        assert_eq!(
            build_push_url("rtmp://h", 1935, "R1", None, 12, 1),
            "rtmp://h:1935/live/R1/12/Camera_1"
        );
    }
}
