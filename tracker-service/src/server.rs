//! Unix socket server for querying the tracker

use crate::cycle::CaptureCycle;
use crate::observation::{from_unix, DeviceId};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// One JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Devices {
        #[serde(default)]
        include_inactive: bool,
    },
    Device {
        device_id: DeviceId,
    },
    History {
        device_id: DeviceId,
        /// Unix seconds
        #[serde(default)]
        since: Option<i64>,
        #[serde(default)]
        until: Option<i64>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Latest,
    Stats,
    /// Run a capture cycle now
    Capture,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                status: ResponseStatus::Ok,
                data: Some(value),
                message: None,
            },
            Err(e) => Self::error(&format!("Serialization error: {}", e)),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.to_string()),
        }
    }
}

/// Shared state for the query service
struct ServiceState {
    storage: Arc<Mutex<Storage>>,
    cycle: Option<Arc<CaptureCycle>>,
}

/// Query server that listens on a Unix socket
pub struct QueryServer {
    socket_path: PathBuf,
    state: Arc<ServiceState>,
}

impl QueryServer {
    pub fn new(socket_path: PathBuf, storage: Arc<Mutex<Storage>>) -> Self {
        Self {
            socket_path,
            state: Arc::new(ServiceState {
                storage,
                cycle: None,
            }),
        }
    }

    /// Let clients trigger capture cycles with `{"op":"capture"}`
    pub fn with_cycle(socket_path: PathBuf, cycle: Arc<CaptureCycle>) -> Self {
        Self {
            socket_path,
            state: Arc::new(ServiceState {
                storage: Arc::clone(cycle.storage()),
                cycle: Some(cycle),
            }),
        }
    }

    /// Start the server and listen for connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Query server listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answer a request directly, without the socket
    pub async fn process(&self, request: Request) -> Response {
        process_request(&self.state, request).await
    }
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<ServiceState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => process_request(&state, request).await,
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                Response::error(&format!("Parse error: {}", e))
            }
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

async fn process_request(state: &ServiceState, request: Request) -> Response {
    let result = match request {
        Request::Capture => return run_capture(state).await,
        Request::Devices { include_inactive } => state
            .storage
            .lock()
            .await
            .list_devices(include_inactive)
            .map(|devices| Response::ok(&devices)),
        Request::Device { device_id } => {
            state
                .storage
                .lock()
                .await
                .find_device(device_id)
                .map(|device| match device {
                    Some(device) => Response::ok(&device),
                    None => Response::error(&format!("Device {} not found", device_id)),
                })
        }
        Request::History {
            device_id,
            since,
            until,
            limit,
        } => state
            .storage
            .lock()
            .await
            .device_history(device_id, since.map(from_unix), until.map(from_unix), limit)
            .map(|history| Response::ok(&history)),
        Request::Latest => state
            .storage
            .lock()
            .await
            .latest_observations()
            .map(|latest| Response::ok(&latest)),
        Request::Stats => state
            .storage
            .lock()
            .await
            .stats()
            .map(|stats| Response::ok(&stats)),
    };

    result.unwrap_or_else(|e| {
        error!("Storage error: {}", e);
        Response::error(&format!("Storage error: {}", e))
    })
}

async fn run_capture(state: &ServiceState) -> Response {
    let Some(cycle) = &state.cycle else {
        return Response::error("Capture is not available on this server");
    };

    match cycle.run_once().await {
        Ok(report) => Response::ok(&report),
        Err(e) => {
            error!("Triggered capture failed: {}", e);
            Response::error(&format!("Capture failed: {}", e))
        }
    }
}
