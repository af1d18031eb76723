//! Testing utilities for the biocode workspace
//!
//! Shared fixtures: deterministic key seeds, sample planes and a fake
//! registry HTTP server.

#![allow(missing_docs)]

use biocode_core::{PixelArray, PixelData, PixelType, Plane, PlaneCoord, SceneInfo};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use warp::http::StatusCode;
use warp::Filter;

/// Seed of the signing key used across tests
pub const TEST_SEED: [u8; 32] = [42u8; 32];

/// Seed of a second, unrelated signing key
pub const OTHER_SEED: [u8; 32] = [17u8; 32];

/// Hub id used across tests
pub const TEST_HUB_ID: u32 = 7;

/// Public image server URL used across tests
pub const TEST_PUBLIC_URL: &str = "https://omero.test";

pub fn u8_plane(coord: PlaneCoord, size_y: usize, size_x: usize, values: Vec<u8>) -> Plane {
    Plane {
        coord,
        pixels: PixelArray::plane(size_y, size_x, PixelData::U8(values)).unwrap(),
    }
}

/// The 2x2 uint8 plane holding `0, 1, 2, 3`
pub fn scenario_a_plane() -> Plane {
    u8_plane(PlaneCoord::new(0, 0, 0, 0), 2, 2, vec![0, 1, 2, 3])
}

pub fn scene(size_z: usize, size_c: usize, size_t: usize, size_y: usize, size_x: usize) -> SceneInfo {
    SceneInfo {
        size_z,
        size_c,
        size_t,
        size_y,
        size_x,
        pixel_type: PixelType::U8,
    }
}

/// Planes of two scenes with Z=1, C=1, T=2 and 2x2 samples
///
/// Every plane is filled with its position in traversal order.
pub fn two_scene_planes() -> Vec<Vec<Plane>> {
    let mut value = 0u8;
    (0..2)
        .map(|s| {
            (0..2)
                .map(|t| {
                    let plane = u8_plane(PlaneCoord::new(s, 0, 0, t), 2, 2, vec![value; 4]);
                    value += 1;
                    plane
                })
                .collect()
        })
        .collect()
}

/// URL on localhost where nothing is listening
pub fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// How the fake registry answers well-formed submissions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistryMode {
    /// 200 for a new datahash, 409 with the existing id for a repeat
    #[default]
    Normal,
    /// 409 whose body is not JSON
    GarbledConflict,
    /// 200 whose body lacks `credentialSubject`
    MalformedSuccess,
    /// Hold the request far longer than any client timeout
    Stall,
}

/// How long a stalled request is held
pub const STALL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct RegistryState {
    by_datahash: HashMap<String, String>,
    seen_nonces: HashSet<String>,
    submissions: Vec<Value>,
    fail_next: u32,
    mode: RegistryMode,
}

struct Answer {
    status: StatusCode,
    body: String,
    stall: bool,
}

impl Answer {
    fn json(status: StatusCode, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            stall: false,
        }
    }
}

/// In-process registry answering `POST /declaration`
///
/// The first submission of a datahash gets 200 with a fresh id; later
/// submissions of the same datahash get 409 with that id. A nonce is
/// accepted once; a replay gets 400 even if its first use was answered
/// with an injected failure. Shuts down on drop.
pub struct FakeRegistry {
    addr: SocketAddr,
    state: Arc<Mutex<RegistryState>>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeRegistry {
    /// Start on an ephemeral port; must be called inside a tokio runtime
    pub fn start() -> Self {
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let shared = state.clone();
        let route = warp::path("declaration")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |body: Value| {
                let shared = shared.clone();
                async move {
                    let answer = handle(&shared, body);
                    if answer.stall {
                        tokio::time::sleep(STALL).await;
                    }
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::with_header(answer.body, "content-type", "application/json"),
                        answer.status,
                    ))
                }
            });

        let (tx, rx) = oneshot::channel::<()>();
        let (addr, server) = warp::serve(route).bind_with_graceful_shutdown(([127, 0, 0, 1], 0), async {
            rx.await.ok();
        });
        tokio::spawn(server);

        Self {
            addr,
            state,
            _shutdown: tx,
        }
    }

    /// Base URL, without the `/declaration` path
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Bodies received so far, including rejected ones
    pub fn submissions(&self) -> Vec<Value> {
        self.state.lock().submissions.clone()
    }

    /// Number of distinct datahashes declared
    pub fn declared_count(&self) -> usize {
        self.state.lock().by_datahash.len()
    }

    /// Answer the next `n` submissions with 503
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Change how well-formed submissions are answered
    pub fn set_mode(&self, mode: RegistryMode) {
        self.state.lock().mode = mode;
    }
}

fn handle(state: &Mutex<RegistryState>, body: Value) -> Answer {
    let mut state = state.lock();
    state.submissions.push(body.clone());

    if let Some(nonce) = body.get("nonce").and_then(Value::as_str) {
        if !state.seen_nonces.insert(nonce.to_string()) {
            return Answer::json(
                StatusCode::BAD_REQUEST,
                &json!({"error": {"message": "nonce already used"}}),
            );
        }
    }

    if state.fail_next > 0 {
        state.fail_next -= 1;
        return Answer::json(StatusCode::SERVICE_UNAVAILABLE, &json!({"error": "unavailable"}));
    }

    match state.mode {
        RegistryMode::Normal => {}
        RegistryMode::GarbledConflict => {
            return Answer {
                status: StatusCode::CONFLICT,
                body: "<html>conflict</html>".to_string(),
                stall: false,
            };
        }
        RegistryMode::MalformedSuccess => {
            return Answer::json(StatusCode::OK, &json!({"status": "ok"}));
        }
        RegistryMode::Stall => {
            return Answer {
                status: StatusCode::OK,
                body: "{}".to_string(),
                stall: true,
            };
        }
    }

    let Some(datahash) = body.get("datahash").and_then(Value::as_str) else {
        return Answer::json(StatusCode::BAD_REQUEST, &json!({"error": "missing datahash"}));
    };

    if let Some(existing) = state.by_datahash.get(datahash) {
        return Answer::json(
            StatusCode::CONFLICT,
            &json!({"error": {"message": "already declared", "existing_iscc_id": existing}}),
        );
    }

    let iscc_id = format!("ISCC:MAIWFAKE{:08}", state.by_datahash.len() + 1);
    state.by_datahash.insert(datahash.to_string(), iscc_id.clone());
    Answer::json(
        StatusCode::OK,
        &json!({"credentialSubject": {"declaration": {"iscc_id": iscc_id}}}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(answer: &Answer) -> Value {
        serde_json::from_str(&answer.body).unwrap()
    }

    #[test]
    fn duplicate_datahash_conflicts() {
        let state = Mutex::new(RegistryState::default());
        let first = handle(&state, json!({"datahash": "1e20aa"}));
        assert_eq!(first.status, StatusCode::OK);
        let id = body(&first)["credentialSubject"]["declaration"]["iscc_id"].clone();

        let second = handle(&state, json!({"datahash": "1e20aa"}));
        assert_eq!(second.status, StatusCode::CONFLICT);
        assert_eq!(body(&second)["error"]["existing_iscc_id"], id);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let state = Mutex::new(RegistryState::default());
        state.lock().fail_next = 1;
        assert_eq!(handle(&state, json!({"datahash": "x"})).status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(handle(&state, json!({"datahash": "x"})).status, StatusCode::OK);
    }

    #[test]
    fn replayed_nonce_is_rejected_even_after_a_failure() {
        let state = Mutex::new(RegistryState::default());
        state.lock().fail_next = 1;
        let note = json!({"datahash": "x", "nonce": "007a"});
        assert_eq!(handle(&state, note.clone()).status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(handle(&state, note).status, StatusCode::BAD_REQUEST);
        assert_eq!(
            handle(&state, json!({"datahash": "x", "nonce": "007b"})).status,
            StatusCode::OK
        );
    }

    #[test]
    fn modes_shape_the_answer() {
        let state = Mutex::new(RegistryState::default());
        state.lock().mode = RegistryMode::GarbledConflict;
        let garbled = handle(&state, json!({"datahash": "x"}));
        assert_eq!(garbled.status, StatusCode::CONFLICT);
        assert!(serde_json::from_str::<Value>(&garbled.body).is_err());

        state.lock().mode = RegistryMode::MalformedSuccess;
        let malformed = handle(&state, json!({"datahash": "x"}));
        assert_eq!(malformed.status, StatusCode::OK);
        assert!(body(&malformed).get("credentialSubject").is_none());

        state.lock().mode = RegistryMode::Stall;
        assert!(handle(&state, json!({"datahash": "x"})).stall);
        assert_eq!(state.lock().by_datahash.len(), 0);
    }

    #[test]
    fn two_scene_fixture_is_in_traversal_order() {
        let scenes = two_scene_planes();
        let coords: Vec<_> = scenes.iter().flatten().map(|p| p.coord).collect();
        assert_eq!(
            coords,
            vec![
                PlaneCoord::new(0, 0, 0, 0),
                PlaneCoord::new(0, 0, 0, 1),
                PlaneCoord::new(1, 0, 0, 0),
                PlaneCoord::new(1, 0, 0, 1),
            ]
        );
    }
}
