//! Protocol session: one live connection to the orchestrator.
//!
//! [`Client`] outlives connections and holds everything that must survive a
//! reconnect (name, last reported state, managed process). [`run`] drives a
//! single connection: announce, then read one command line at a time and run
//! its handler to completion before reading the next.
//!
//! A handler failure ends the session with [`SessionError::Command`]; the
//! connector treats that like any other disconnect and reconnects.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::process::platform::{self, SystemProcessControl};
use crate::process::{ProcessControl, ProcessManager, StartOutcome, StopError, StopOutcome};
use crate::protocol::{self, ClientState, Command, ProtocolError};
use crate::workspace::{Workspace, WorkspaceError};

/// Why a command handler failed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("failed to start {}: {source}", path.display())]
    Spawn { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error("failed to report state: {0}")]
    Report(#[source] io::Error),
}

/// Why a session ended without a shutdown request.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by server")]
    PeerClosed,
    #[error("Error in command {verb}: {source}")]
    Command {
        verb: &'static str,
        source: CommandError,
    },
}

/// What the read loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// State that lives for the whole run of the agent.
pub struct Client<C: ProcessControl = SystemProcessControl> {
    name: String,
    state: ClientState,
    running: bool,
    workspace: Workspace,
    app_name: String,
    clear_retry: Duration,
    processes: ProcessManager<C>,
}

impl<C: ProcessControl> Client<C> {
    pub fn new(config: &Config, control: C) -> Self {
        Self {
            name: config.client.name.clone(),
            state: ClientState::WaitingForCommands,
            running: true,
            workspace: Workspace::new(config.deploy.work_dir.clone()),
            app_name: config.deploy.app_name.clone(),
            clear_retry: config.deploy.clear_retry(),
            processes: ProcessManager::new(control),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// False once the orchestrator asked the agent to shut down.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn processes(&self) -> &ProcessManager<C> {
        &self.processes
    }
}

/// Drive one connection until it fails or the orchestrator requests shutdown.
///
/// Returns `Ok(())` only on `shutdown`. EOF, read errors and handler failures
/// are all errors, which the caller answers by reconnecting.
pub async fn run<S, C>(client: &mut Client<C>, stream: S) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ProcessControl,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session { client, writer };

    session.announce().await?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || !line.ends_with('\n') {
            // EOF, possibly in the middle of a line
            return Err(SessionError::PeerClosed);
        }
        let text = protocol::trim_line(&line);

        let command = match protocol::parse_line(text) {
            Ok(command) => command,
            Err(e) if e.is_recoverable() => {
                warn!("{e}");
                continue;
            }
            Err(e) => {
                return Err(SessionError::Command {
                    verb: e.verb(),
                    source: e.into(),
                });
            }
        };

        let verb = command.verb();
        debug!(verb, "Received command");
        match session.dispatch(command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => return Ok(()),
            Err(source) => return Err(SessionError::Command { verb, source }),
        }
    }
}

struct Session<'a, W, C: ProcessControl> {
    client: &'a mut Client<C>,
    writer: W,
}

impl<W, C> Session<'_, W, C>
where
    W: AsyncWrite + Unpin,
    C: ProcessControl,
{
    async fn send(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    /// State, name and platform, in that order.
    async fn announce(&mut self) -> io::Result<()> {
        let state = self.client.state;
        self.send(&protocol::state_line(state)).await?;
        let name = protocol::name_line(&self.client.name);
        self.send(&name).await?;
        self.send(&protocol::platform_line()).await
    }

    /// Record `state` locally and tell the orchestrator.
    async fn report(&mut self, state: ClientState) -> Result<(), CommandError> {
        self.client.state = state;
        debug!(%state, "Reporting state");
        self.send(&protocol::state_line(state))
            .await
            .map_err(CommandError::Report)
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, CommandError> {
        match command {
            Command::ClearDirectory => self.clear_directory().await?,
            Command::Directory(path) => self.directory(&path).await?,
            Command::File { path, content } => self.file(&path, &content).await?,
            Command::Start => self.start().await?,
            Command::Stop => self.stop().await?,
            Command::FilesDone => self.report(ClientState::Waiting).await?,
            Command::Shutdown => {
                self.report(ClientState::ShuttingDown).await?;
                info!("Shutdown requested by server");
                self.client.running = false;
                return Ok(Flow::Shutdown);
            }
        }
        Ok(Flow::Continue)
    }

    /// Wipe the workspace so a new build can be loaded. The directory may be
    /// held open by the application being replaced, so deletion is retried
    /// until it succeeds.
    async fn clear_directory(&mut self) -> Result<(), CommandError> {
        self.report(ClientState::ClearingDirectory).await?;
        loop {
            match self.client.workspace.remove().await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Trouble clearing directory (retrying shortly): {e}");
                    self.report(ClientState::TroubleClearingDirectory).await?;
                    tokio::time::sleep(self.client.clear_retry).await;
                }
            }
        }
        self.client.workspace.create_root().await?;
        info!(dir = %self.client.workspace.root().display(), "Cleared working directory");
        Ok(())
    }

    async fn directory(&mut self, path: &str) -> Result<(), CommandError> {
        self.report(ClientState::LoadingFolders).await?;
        let created = self.client.workspace.create_dir(path).await?;
        debug!(path = %created.display(), "Created directory");
        Ok(())
    }

    async fn file(&mut self, path: &str, content: &[u8]) -> Result<(), CommandError> {
        self.report(ClientState::LoadingFiles).await?;
        let written = self.client.workspace.write_file(path, content).await?;
        debug!(path = %written.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), CommandError> {
        if self.client.processes.is_running() {
            debug!("Application already running, ignoring start");
            return Ok(());
        }
        self.report(ClientState::Running).await?;

        let workspace = &self.client.workspace;
        let executable = workspace.absolute(&platform::executable_path(&self.client.app_name))?;
        let working_dir = workspace.absolute_root()?;
        platform::ensure_executable(&executable)
            .await
            .map_err(|source| CommandError::Spawn {
                path: executable.clone(),
                source,
            })?;

        let name = platform::process_name(&self.client.app_name);
        let outcome = self
            .client
            .processes
            .start(executable.clone(), &working_dir, name)
            .map_err(|source| CommandError::Spawn {
                path: executable,
                source,
            })?;
        debug_assert_eq!(outcome, StartOutcome::Started);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CommandError> {
        if !self.client.processes.is_running() {
            debug!("No application running, ignoring stop");
            return Ok(());
        }
        self.report(ClientState::Stopped).await?;
        match self.client.processes.stop().await? {
            StopOutcome::Stopped => info!("Stopped managed process"),
            StopOutcome::AlreadyExited | StopOutcome::NotRunning => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeControl;
    use crate::protocol::encode_arg;
    use std::path::Path;
    use tokio::io::AsyncReadExt;

    fn client(root: &Path) -> Client<FakeControl> {
        let mut config = Config::default();
        config.client.name = "bot1".to_string();
        config.deploy.work_dir = root.join("appDir");
        config.deploy.clear_retry_ms = 10;
        Client::new(&config, FakeControl::default())
    }

    /// Feed `input` to a session, then collect everything the client sent.
    async fn exchange(
        client: &mut Client<FakeControl>,
        input: &str,
    ) -> (Result<(), SessionError>, Vec<String>) {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        remote.write_all(input.as_bytes()).await.unwrap();
        remote.shutdown().await.unwrap();
        let result = run(client, local).await;
        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        (result, out.lines().map(ToString::to_string).collect())
    }

    fn states(lines: &[String]) -> Vec<&str> {
        lines
            .iter()
            .skip(3)
            .filter_map(|l| l.strip_prefix("state "))
            .collect()
    }

    #[tokio::test]
    async fn test_announcement() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "").await;

        assert!(matches!(result, Err(SessionError::PeerClosed)));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "state Waiting_for_commands");
        assert_eq!(lines[1], "name bot1");
        assert_eq!(
            lines[2],
            format!("OS {} {}", std::env::consts::OS, std::env::consts::ARCH)
        );
    }

    #[tokio::test]
    async fn test_provisioning_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let input = format!(
            "clearDirectory\ndirectory {}\nfile {} {}\nfilesDone\nstart\nshutdown\n",
            encode_arg(b"assets"),
            encode_arg(b"assets/a.txt"),
            encode_arg(b"hi"),
        );
        let (result, lines) = exchange(&mut client, &input).await;

        assert!(result.is_ok());
        assert!(!client.is_running());
        assert_eq!(
            states(&lines),
            vec![
                "Clearing_directory",
                "Loading_folders",
                "Loading_files",
                "Waiting",
                "Running",
                "Shutting_down",
            ]
        );

        let root = dir.path().join("appDir");
        assert!(root.join("assets").is_dir());
        assert_eq!(std::fs::read(root.join("assets/a.txt")).unwrap(), b"hi");

        let spawned = &client.processes().control().spawned;
        assert_eq!(spawned.len(), 1);
        let (exe, cwd) = &spawned[0];
        assert!(exe.is_absolute());
        assert!(exe.starts_with(cwd));
        assert!(cwd.ends_with("appDir"));
    }

    #[tokio::test]
    async fn test_full_cycle_state_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let input = format!(
            "clearDirectory\ndirectory {}\ndirectory {}\nfile {} {}\nfilesDone\nstart\nstop\n",
            encode_arg(b"a"),
            encode_arg(b"a/b"),
            encode_arg(b"a/b/c.bin"),
            encode_arg(&[1, 2, 3]),
        );
        let (result, lines) = exchange(&mut client, &input).await;

        assert!(matches!(result, Err(SessionError::PeerClosed)));
        assert_eq!(
            states(&lines),
            vec![
                "Clearing_directory",
                "Loading_folders",
                "Loading_folders",
                "Loading_files",
                "Waiting",
                "Running",
                "Stopped",
            ]
        );
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(!client.processes().is_running());
        assert_eq!(client.processes().control().stopped.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "start\nstart\nshutdown\n").await;

        assert!(result.is_ok());
        assert_eq!(states(&lines), vec!["Running", "Shutting_down"]);
        assert_eq!(client.processes().control().spawned.len(), 1);
        assert!(client.processes().is_running());
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "stop\nfilesDone\nshutdown\n").await;

        assert!(result.is_ok());
        assert_eq!(states(&lines), vec!["Waiting", "Shutting_down"]);
        assert!(client.processes().control().stopped.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_verb_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "foo bar\n\nfilesDone\nshutdown\n").await;

        assert!(result.is_ok());
        assert_eq!(states(&lines), vec!["Waiting", "Shutting_down"]);
    }

    #[tokio::test]
    async fn test_crlf_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "filesDone\r\nshutdown\r\n").await;

        assert!(result.is_ok());
        assert_eq!(states(&lines), vec!["Waiting", "Shutting_down"]);
    }

    #[tokio::test]
    async fn test_clear_directory_removes_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("appDir");
        std::fs::create_dir_all(root.join("old/nested")).unwrap();
        std::fs::write(root.join("old/nested/stale.txt"), b"stale").unwrap();

        let mut client = client(dir.path());
        let input = format!("clearDirectory\ndirectory {}\nshutdown\n", encode_arg(b""));
        let (result, _) = exchange(&mut client, &input).await;

        assert!(result.is_ok());
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clear_directory_retries_until_removal_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the directory should be makes removal fail
        let root = dir.path().join("appDir");
        std::fs::write(&root, b"locked").unwrap();
        let blocker = root.clone();
        let unlock = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::remove_file(blocker).unwrap();
        });

        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "clearDirectory\nfilesDone\nshutdown\n").await;
        unlock.join().unwrap();

        assert!(result.is_ok());
        let states = states(&lines);
        assert_eq!(states[0], "Clearing_directory");
        let troubles = states[1..]
            .iter()
            .take_while(|s| **s == "Trouble_clearing_directory")
            .count();
        assert!(troubles >= 1);
        assert_eq!(&states[1 + troubles..], ["Waiting", "Shutting_down"]);
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_bad_argument_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "file !!! aGk=\nfilesDone\n").await;

        match result {
            Err(SessionError::Command { verb, source }) => {
                assert_eq!(verb, "file");
                assert!(matches!(source, CommandError::Protocol(ProtocolError::Base64 { .. })));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Nothing after the failing command ran
        assert!(states(&lines).is_empty());
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn test_path_traversal_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let input = format!(
            "clearDirectory\nfile {} {}\n",
            encode_arg(b"../escape.txt"),
            encode_arg(b"x")
        );
        let (result, lines) = exchange(&mut client, &input).await;

        assert!(matches!(
            result,
            Err(SessionError::Command {
                verb: "file",
                source: CommandError::Workspace(WorkspaceError::InvalidPath { .. })
            })
        ));
        assert_eq!(states(&lines), vec!["Clearing_directory", "Loading_files"]);
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.deploy.work_dir = dir.path().to_path_buf();
        let mut client = Client::new(
            &config,
            FakeControl {
                fail_spawn: true,
                ..FakeControl::default()
            },
        );
        let (result, _) = exchange(&mut client, "start\n").await;

        assert!(matches!(
            result,
            Err(SessionError::Command {
                verb: "start",
                source: CommandError::Spawn { .. }
            })
        ));
        assert!(!client.processes().is_running());
    }

    #[tokio::test]
    async fn test_partial_line_at_eof_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let (result, lines) = exchange(&mut client, "filesDone\nshutdown").await;

        assert!(matches!(result, Err(SessionError::PeerClosed)));
        assert_eq!(states(&lines), vec!["Waiting"]);
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn test_reconnect_announces_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path());
        let _ = exchange(&mut client, "filesDone\n").await;

        let (_, lines) = exchange(&mut client, "").await;
        assert_eq!(lines[0], "state Waiting");
    }
}
