//! Remote playback device boundary.
//!
//! The robot speaks a vendor protocol, so the relay talks to it through a
//! small JSON bridge process: search, connect, program mode, and a single
//! "play audio from URL" command whose structured result is the only
//! confirmation that playback happened.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::RobotConfig;
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Programming,
    /// No remote device; playback happens on this host.
    Local,
    Released,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::Programming => write!(f, "PROGRAMMING"),
            Self::Local => write!(f, "LOCAL"),
            Self::Released => write!(f, "RELEASED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub handle: String,
    pub state: SessionState,
}

impl RemoteSession {
    pub fn local(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            state: SessionState::Local,
        }
    }

    /// Whether the device will accept commands.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Programming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    NetPublic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayAudioRequest {
    pub url: String,
    pub storage_type: StorageType,
    pub volume: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultType {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayAudioResponse {
    pub result_type: ResultType,
    #[serde(rename = "isSuccess")]
    pub is_success: bool,
    #[serde(rename = "resultCode")]
    pub result_code: i32,
}

#[async_trait]
pub trait RemoteDevice: Send + Sync {
    /// Search for a device whose name contains `serial`.
    async fn find(&self, serial: &str, timeout: Duration) -> Result<Option<DeviceInfo>, DeviceError>;

    async fn list(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, DeviceError>;

    async fn connect(&self, device: &DeviceInfo) -> Result<bool, DeviceError>;

    async fn enter_program(&self) -> Result<bool, DeviceError>;

    async fn play_audio(&self, request: &PlayAudioRequest) -> Result<PlayAudioResponse, DeviceError>;

    async fn quit_program(&self) -> Result<(), DeviceError>;

    async fn release(&self) -> Result<(), DeviceError>;
}

#[derive(Deserialize)]
struct AckResponse {
    ok: bool,
}

/// JSON bridge client for the robot SDK.
pub struct BridgeDevice {
    base_url: String,
    client: Client,
}

impl BridgeDevice {
    pub fn new(config: &RobotConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.search_timeout_secs + 30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn ack(&self, path: &str, body: serde_json::Value) -> Result<bool, DeviceError> {
        let resp = self.client.post(self.url(path)).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(DeviceError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<AckResponse>().await?.ok)
    }
}

#[async_trait]
impl RemoteDevice for BridgeDevice {
    async fn find(&self, serial: &str, timeout: Duration) -> Result<Option<DeviceInfo>, DeviceError> {
        debug!("Bridge: find {serial} (timeout {}s)", timeout.as_secs());
        let resp = self
            .client
            .get(self.url("/devices/find"))
            .query(&[("name", serial.to_string()), ("timeout", timeout.as_secs().to_string())])
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => Ok(Some(resp.json().await?)),
            s => Err(DeviceError::Status(s.as_u16())),
        }
    }

    async fn list(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, DeviceError> {
        let resp = self
            .client
            .get(self.url("/devices"))
            .query(&[("timeout", timeout.as_secs().to_string())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DeviceError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<bool, DeviceError> {
        self.ack("/connect", json!(device)).await
    }

    async fn enter_program(&self) -> Result<bool, DeviceError> {
        self.ack("/program/enter", json!({})).await
    }

    async fn play_audio(&self, request: &PlayAudioRequest) -> Result<PlayAudioResponse, DeviceError> {
        let resp = self
            .client
            .post(self.url("/audio/play"))
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DeviceError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    async fn quit_program(&self) -> Result<(), DeviceError> {
        self.ack("/program/quit", json!({})).await.map(|_| ())
    }

    async fn release(&self) -> Result<(), DeviceError> {
        self.ack("/release", json!({})).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn spawn_bridge() -> BridgeDevice {
        let app = Router::new()
            .route(
                "/devices/find",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("name").map(String::as_str) == Some("20256") {
                        Json(json!({"name": "Mini_20256", "address": "192.168.1.40", "port": 8800}))
                            .into_response()
                    } else {
                        AxumStatus::NOT_FOUND.into_response()
                    }
                }),
            )
            .route("/connect", post(|| async { Json(json!({"ok": true})) }))
            .route("/program/enter", post(|| async { Json(json!({"ok": false})) }))
            .route(
                "/audio/play",
                post(|Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(body["storage_type"], "NET_PUBLIC");
                    Json(json!({"result_type": "Success", "isSuccess": false, "resultCode": 7}))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        BridgeDevice::new(&RobotConfig {
            bridge_url: format!("http://{addr}/"),
            ..RobotConfig::default()
        })
    }

    #[tokio::test]
    async fn find_returns_device_or_none() {
        let bridge = spawn_bridge().await;
        let found = bridge.find("20256", Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.map(|d| d.name), Some("Mini_20256".to_string()));
        assert!(bridge.find("99999", Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acks_are_reported() {
        let bridge = spawn_bridge().await;
        let device = DeviceInfo {
            name: "Mini_20256".into(),
            address: "192.168.1.40".into(),
            port: 8800,
        };
        assert!(bridge.connect(&device).await.unwrap());
        assert!(!bridge.enter_program().await.unwrap());
    }

    #[tokio::test]
    async fn play_audio_parses_structured_result() {
        let bridge = spawn_bridge().await;
        let response = bridge
            .play_audio(&PlayAudioRequest {
                url: "http://10.0.0.2:8000/a.mp3".into(),
                storage_type: StorageType::NetPublic,
                volume: 1.0,
            })
            .await
            .unwrap();
        assert_eq!(response.result_type, ResultType::Success);
        assert!(!response.is_success);
        assert_eq!(response.result_code, 7);
    }

    #[tokio::test]
    async fn missing_route_is_status_error() {
        let bridge = spawn_bridge().await;
        assert!(matches!(bridge.release().await, Err(DeviceError::Status(404))));
    }

    #[test]
    fn local_session_is_not_active() {
        assert!(!RemoteSession::local("speaker").is_active());
    }
}
