//! Per-camera transcoder session supervision.
//!
//! At most one live transcoder process exists per camera id. The registry is
//! the only cross-connection shared mutable state in the gateway; every
//! lookup/insert/remove holds its mutex, and a per-session token lets the
//! owning relay distinguish "my process died" from "someone closed or
//! replaced my session out of band".

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CameraEndpoint, Credentials, TranscoderConfig};
use crate::relay::{PumpEnd, PumpMode, RelaySink, StreamPump};
use crate::transcoder::command::{build_args, redact, resolve_binary};

/// Relay chunk size: ten 188-byte transport-stream packets.
pub const TS_CHUNK_SIZE: usize = 188 * 10;

/// How long to wait after spawn before probing whether the process survived
/// connecting to its source.
const SPAWN_PROBE_DELAY: Duration = Duration::from_millis(500);

/// Grace period between the terminate signal and a force kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Bound on reading leftover stderr diagnostics from a dead process.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Narrow seam for spawning the external media source, so the supervision
/// logic is independent of which concrete binary is resolved.
pub trait MediaSpawner: Send + Sync + 'static {
    /// Spawn a transcoder for `source_path` with stdout and stderr piped.
    fn spawn(
        &self,
        endpoint: &CameraEndpoint,
        credentials: &Credentials,
        source_path: &str,
    ) -> io::Result<Child>;
}

/// Production spawner: ffmpeg in passthrough-copy mode.
pub struct FfmpegSpawner {
    binary: std::path::PathBuf,
}

impl FfmpegSpawner {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            binary: resolve_binary(config),
        }
    }
}

impl MediaSpawner for FfmpegSpawner {
    fn spawn(
        &self,
        endpoint: &CameraEndpoint,
        credentials: &Credentials,
        source_path: &str,
    ) -> io::Result<Child> {
        let rtsp_url = endpoint
            .rtsp_url(credentials, source_path)
            .map_err(io::Error::other)?;
        let args = build_args(rtsp_url.as_str());

        info!(
            camera = endpoint.id,
            command = %redact(&self.binary.to_string_lossy(), &args, &credentials.password),
            "starting transcoder"
        );

        Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

struct Session {
    child: Child,
    source_path: String,
    started_at: Instant,
    token: u64,
}

/// Owns the session registry and the spawn/probe/relay/fallback loop.
pub struct TranscoderSupervisor {
    spawner: Arc<dyn MediaSpawner>,
    sessions: Mutex<HashMap<u8, Session>>,
    next_token: AtomicU64,
}

impl TranscoderSupervisor {
    pub fn new(spawner: Arc<dyn MediaSpawner>) -> Self {
        Self {
            spawner,
            sessions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Stream one camera's transcoded output into `sink`.
    ///
    /// Tries each RTSP source path in priority order. A process that dies
    /// before producing data, or mid-stream, advances to the next path; once
    /// every path is exhausted the sink is dropped and the committed response
    /// simply ends. Client disconnect terminates the process immediately.
    pub async fn stream_session(
        &self,
        endpoint: &CameraEndpoint,
        credentials: &Credentials,
        sink: RelaySink,
    ) {
        for source_path in CameraEndpoint::RTSP_PATHS {
            let mut child = match self.spawner.spawn(endpoint, credentials, source_path) {
                Ok(child) => child,
                Err(e) => {
                    error!(camera = endpoint.id, source = source_path, error = %e,
                        "failed to spawn transcoder");
                    continue;
                }
            };
            let Some(stdout) = child.stdout.take() else {
                error!(camera = endpoint.id, "transcoder spawned without stdout pipe");
                terminate(child).await;
                continue;
            };
            let mut stderr = child.stderr.take();

            let token = self.register(endpoint.id, source_path, child).await;

            // Give the process a moment to connect to its source.
            tokio::time::sleep(SPAWN_PROBE_DELAY).await;
            if let Some(status) = self.early_exit_status(endpoint.id, token) {
                let diagnostics = drain_stderr(stderr.take()).await;
                error!(camera = endpoint.id, source = source_path, %status, diagnostics,
                    "transcoder exited before producing data");
                if let Some(session) = self.take_if(endpoint.id, token) {
                    drop(session.child);
                }
                continue;
            }

            debug!(camera = endpoint.id, source = source_path, "transcoder relay started");
            let pump = StreamPump::new(PumpMode::Chunk { size: TS_CHUNK_SIZE });
            let end = pump.run(stdout, &sink).await;

            match end {
                PumpEnd::ClientGone | PumpEnd::Cancelled => {
                    debug!(camera = endpoint.id, "client disconnected; terminating transcoder");
                    if let Some(session) = self.take_if(endpoint.id, token) {
                        terminate(session.child).await;
                    }
                    return;
                }
                PumpEnd::SourceEof | PumpEnd::SourceError(_) => {
                    // The session disappearing from the registry means it was
                    // closed or replaced out of band; do not fall back then.
                    let Some(session) = self.take_if(endpoint.id, token) else {
                        return;
                    };
                    let diagnostics = drain_stderr(stderr.take()).await;
                    error!(
                        camera = endpoint.id,
                        source = source_path,
                        uptime_secs = session.started_at.elapsed().as_secs(),
                        diagnostics,
                        "transcoder stream ended"
                    );
                    terminate(session.child).await;
                }
            }
        }

        warn!(camera = endpoint.id, "all transcoder source paths exhausted");
    }

    /// Insert a session, terminating any live session for the same camera.
    pub(crate) async fn register(&self, camera_id: u8, source_path: &str, child: Child) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            child,
            source_path: source_path.to_string(),
            started_at: Instant::now(),
            token,
        };
        let evicted = { self.sessions.lock().insert(camera_id, session) };
        if let Some(old) = evicted {
            debug!(camera = camera_id, "replacing live transcoder session");
            terminate(old.child).await;
        }
        token
    }

    /// Check whether our registered child has already exited.
    fn early_exit_status(&self, camera_id: u8, token: u64) -> Option<std::process::ExitStatus> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&camera_id).filter(|s| s.token == token)?;
        session.child.try_wait().ok().flatten()
    }

    /// Remove our session from the registry, but only if it is still ours.
    fn take_if(&self, camera_id: u8, token: u64) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        match sessions.get(&camera_id) {
            Some(session) if session.token == token => sessions.remove(&camera_id),
            _ => None,
        }
    }

    /// Terminate and remove one camera's session. Idempotent.
    pub async fn close_session(&self, camera_id: u8) {
        let session = { self.sessions.lock().remove(&camera_id) };
        if let Some(session) = session {
            info!(camera = camera_id, source = %session.source_path, "closing transcoder session");
            terminate(session.child).await;
        }
    }

    /// Terminate every tracked session and empty the registry. Idempotent.
    pub async fn close_all_sessions(&self) {
        let drained: Vec<(u8, Session)> = { self.sessions.lock().drain().collect() };
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all transcoder sessions");
        }
        for (_, session) in drained {
            terminate(session.child).await;
        }
    }

    /// Snapshot of live sessions as (camera_id, source_path).
    pub fn active(&self) -> Vec<(u8, String)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.source_path.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Terminate a child: polite signal first, bounded wait, then force kill.
async fn terminate(mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    let deadline = Instant::now() + TERMINATE_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            _ => break,
        }
    }
    let _ = child.kill().await;
}

/// Read whatever diagnostics the process left on stderr, bounded in time.
async fn drain_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    use crate::config::CameraConfig;

    /// Spawns `sh -c <script>` per source path, ignoring the RTSP URL.
    struct ScriptedSpawner {
        scripts: HashMap<&'static str, &'static str>,
    }

    impl MediaSpawner for ScriptedSpawner {
        fn spawn(
            &self,
            _endpoint: &CameraEndpoint,
            _credentials: &Credentials,
            source_path: &str,
        ) -> io::Result<Child> {
            let script = self.scripts.get(source_path).copied().unwrap_or("exit 1");
            Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
        }
    }

    fn endpoint() -> CameraEndpoint {
        CameraEndpoint::new(&CameraConfig::default(), 5)
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "root".to_string(),
            password: "pw".to_string(),
        }
    }

    fn sleeper() -> io::Result<Child> {
        Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    #[cfg(unix)]
    fn process_running(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn supervisor_with(scripts: HashMap<&'static str, &'static str>) -> TranscoderSupervisor {
        TranscoderSupervisor::new(Arc::new(ScriptedSpawner { scripts }))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_session_for_same_camera_evicts_the_first() {
        let supervisor = supervisor_with(HashMap::new());

        let first = sleeper().unwrap();
        let first_pid = first.id().unwrap();
        let first_token = supervisor.register(5, "/live1s2.sdp", first).await;

        let second = sleeper().unwrap();
        let second_pid = second.id().unwrap();
        let second_token = supervisor.register(5, "/live1s2.sdp", second).await;

        assert_ne!(first_token, second_token);
        assert_eq!(supervisor.active().len(), 1);
        assert!(!process_running(first_pid));
        assert!(process_running(second_pid));

        supervisor.close_all_sessions().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_all_sessions_leaves_registry_empty() {
        let supervisor = supervisor_with(HashMap::new());

        let a = sleeper().unwrap();
        let a_pid = a.id().unwrap();
        supervisor.register(1, "/live1s2.sdp", a).await;

        let b = sleeper().unwrap();
        let b_pid = b.id().unwrap();
        supervisor.register(2, "/live1s2.sdp", b).await;

        assert_eq!(supervisor.active().len(), 2);
        supervisor.close_all_sessions().await;

        assert!(supervisor.is_empty());
        assert!(!process_running(a_pid));
        assert!(!process_running(b_pid));

        // Idempotent.
        supervisor.close_all_sessions().await;
        assert!(supervisor.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_death_falls_back_to_next_source_path() {
        let supervisor = Arc::new(supervisor_with(HashMap::from([
            ("/live1s2.sdp", "echo 'connection refused' >&2; exit 1"),
            ("/live1s1.sdp", "printf 'tsdata'; sleep 30"),
        ])));

        let (sink, body) = RelaySink::channel(8);
        let streamer = supervisor.clone();
        let task = tokio::spawn(async move {
            streamer
                .stream_session(&endpoint(), &credentials(), sink)
                .await;
        });

        let mut stream = body.into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"tsdata");

        // The surviving session must be on the fallback path.
        assert_eq!(supervisor.active(), vec![(5, "/live1s1.sdp".to_string())]);

        // Client disconnect tears the process down and empties the registry.
        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(supervisor.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_paths_exhausted_ends_with_empty_stream() {
        let supervisor = Arc::new(supervisor_with(HashMap::from([
            ("/live1s2.sdp", "exit 1"),
            ("/live1s1.sdp", "exit 1"),
        ])));

        let (sink, body) = RelaySink::channel(8);
        let streamer = supervisor.clone();
        let task = tokio::spawn(async move {
            streamer
                .stream_session(&endpoint(), &credentials(), sink)
                .await;
        });

        let frames: Vec<_> = tokio::time::timeout(
            Duration::from_secs(10),
            body.into_data_stream().collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert!(frames.is_empty());

        task.await.unwrap();
        assert!(supervisor.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mid_stream_death_advances_to_next_path() {
        let supervisor = Arc::new(supervisor_with(HashMap::from([
            // Survives the probe, emits data, then dies.
            ("/live1s2.sdp", "printf 'first'; sleep 1"),
            ("/live1s1.sdp", "printf 'second'; sleep 30"),
        ])));

        let (sink, body) = RelaySink::channel(8);
        let streamer = supervisor.clone();
        tokio::spawn(async move {
            streamer
                .stream_session(&endpoint(), &credentials(), sink)
                .await;
        });

        let mut stream = body.into_data_stream();
        let mut seen = Vec::new();
        while seen.concat() != b"firstsecond" {
            let frame = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push(frame.to_vec());
        }

        assert_eq!(supervisor.active(), vec![(5, "/live1s1.sdp".to_string())]);
        supervisor.close_all_sessions().await;
    }
}
