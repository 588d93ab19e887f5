use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::protocol::{EXIT, TERMINATOR};
use crate::telemetry::MessageHandler;

const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// FIFO locations for one session. Both share a prefix and carry the session
/// id as suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// Commands to the emulator.
    pub outbound: PathBuf,
    /// Telemetry from the emulator.
    pub inbound: PathBuf,
}

impl PipePaths {
    pub fn new(prefix: &Path, session_id: u32) -> Self {
        let prefix = prefix.display();
        Self {
            outbound: PathBuf::from(format!("{prefix}-out.{session_id}")),
            inbound: PathBuf::from(format!("{prefix}-in.{session_id}")),
        }
    }

    pub fn any_exists(&self) -> bool {
        self.outbound.exists() || self.inbound.exists()
    }
}

/// Bidirectional FIFO pair plus the listener thread draining the inbound side.
pub struct PipeChannel {
    session_id: u32,
    paths: PipePaths,
    handler: Arc<dyn MessageHandler>,
    writer: Mutex<Option<File>>,
    exiting: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PipeChannel {
    /// Creates both FIFOs (reusing any left over from a retry) and starts the
    /// listener. The outbound writer is opened lazily on first send.
    pub fn open(prefix: &Path, session_id: u32, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let paths = PipePaths::new(prefix, session_id);
        make_fifo(&paths.outbound)?;
        make_fifo(&paths.inbound)?;

        let channel = Self {
            session_id,
            paths,
            handler,
            writer: Mutex::new(None),
            exiting: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        channel.spawn_listener()?;
        Ok(channel)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn paths(&self) -> &PipePaths {
        &self.paths
    }

    fn writer(&self) -> MutexGuard<'_, Option<File>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_listener(&self) -> Result<()> {
        let path = self.paths.inbound.clone();
        let handler = self.handler.clone();
        let exiting = self.exiting.clone();
        let handle = std::thread::Builder::new()
            .name(format!("pipe-listener-{}", self.session_id))
            .spawn(move || listen(&path, handler.as_ref(), &exiting))?;
        *self.listener() = Some(handle);
        Ok(())
    }

    pub fn listener_alive(&self) -> bool {
        self.listener()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts a new listener if the previous one has exited. Returns whether
    /// a listener was started.
    pub fn reattach_listener(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.listener_alive() {
            return false;
        }
        if let Some(handle) = self.listener().take() {
            let _ = handle.join();
        }
        match self.spawn_listener() {
            Ok(()) => {
                warn!(session_id = self.session_id, "reattached inbound listener");
                true
            }
            Err(e) => {
                warn!(session_id = self.session_id, "unable to reattach listener: {e}");
                false
            }
        }
    }

    /// Opens the outbound writer if it is not open yet. Fails quietly while
    /// the emulator has not attached its reading end.
    pub fn ensure_writer(&self) -> bool {
        let mut writer = self.writer();
        Self::ensure_open(&mut writer, &self.paths.outbound)
    }

    fn ensure_open(writer: &mut Option<File>, path: &Path) -> bool {
        if writer.is_some() {
            return true;
        }
        match open_writer(path) {
            Ok(file) => {
                *writer = Some(file);
                true
            }
            Err(e) => {
                debug!(path = %path.display(), "outbound pipe not ready: {e}");
                false
            }
        }
    }

    /// Writes one newline-terminated message. Returns `false` when the pipe is
    /// not writable yet; the next call retries with a fresh handle.
    pub fn send(&self, message: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut writer = self.writer();
        if !Self::ensure_open(&mut writer, &self.paths.outbound) {
            return false;
        }
        let Some(file) = writer.as_mut() else {
            return false;
        };
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        match file.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id = self.session_id, "write to outbound pipe failed: {e}");
                *writer = None;
                false
            }
        }
    }

    /// Stops the listener, sends the final exit message and removes both
    /// FIFOs. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.send(EXIT);
        self.closed.store(true, Ordering::Release);
        self.exiting.store(true, Ordering::Release);
        self.writer().take();
        remove_fifo(&self.paths.outbound);

        if let Some(handle) = self.listener().take() {
            self.stop_listener(handle);
        }
        remove_fifo(&self.paths.inbound);
        debug!(session_id = self.session_id, "pipes closed");
    }

    /// A listener blocked in open() or read() only wakes up once something is
    /// written to its end, and it may not have reached open() yet, so the
    /// wake-up is repeated until the thread is gone.
    fn stop_listener(&self, handle: JoinHandle<()>) {
        let deadline = Instant::now() + LISTENER_STOP_TIMEOUT;
        while !handle.is_finished() {
            if let Ok(mut unblock) = open_writer(&self.paths.inbound) {
                let _ = writeln!(unblock, "{EXIT}{TERMINATOR}");
            }
            if Instant::now() >= deadline {
                warn!(session_id = self.session_id, "listener did not stop, detaching it");
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_fifo(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "unable to remove fifo: {e}"),
    }
}

/// Opens a FIFO for writing without blocking on a missing reader (ENXIO),
/// then switches the descriptor back to blocking writes.
fn open_writer(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for both calls.
    #[allow(unsafe_code)]
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only clears O_NONBLOCK.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Listener body. Lines are concatenated until one ends with the terminator,
/// since a message may be split across reads.
fn listen(path: &Path, handler: &dyn MessageHandler, exiting: &AtomicBool) {
    if let Err(e) = make_fifo(path) {
        debug!(path = %path.display(), "inbound pipe unavailable: {e}");
        return;
    }
    if exiting.load(Ordering::Acquire) {
        return;
    }
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), "no telemetry available: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(file);
    let mut buffer = String::new();
    let mut line = String::new();

    while !exiting.load(Ordering::Acquire) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                debug!(path = %path.display(), "emulator closed its telemetry pipe");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(path = %path.display(), "telemetry read failed: {e}");
                break;
            }
        }
        let chunk = line.trim_end();
        if chunk.is_empty() {
            continue;
        }
        buffer.push_str(chunk);
        if let Some(message) = buffer.strip_suffix(TERMINATOR) {
            if message == EXIT || exiting.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = handler.handle(message) {
                error!(message, "dropping telemetry listener: {e}");
                break;
            }
            buffer.clear();
        }
    }
    remove_fifo(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnvError;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: &str) -> Result<()> {
            if message == "boom" {
                return Err(EnvError::Protocol("boom".into()));
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn open_channel(dir: &Path, id: u32) -> (PipeChannel, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let channel = PipeChannel::open(&dir.join("fifo"), id, recorder.clone()).unwrap();
        (channel, recorder)
    }

    #[test]
    fn close_removes_fifos_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = open_channel(dir.path(), 1);
        let paths = channel.paths().clone();
        assert!(paths.outbound.exists());
        assert!(paths.inbound.exists());

        channel.close();
        channel.close();
        assert!(!paths.any_exists());
        assert!(!channel.listener_alive());
    }

    #[test]
    fn split_lines_are_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, recorder) = open_channel(dir.path(), 2);
        let mut emulator = OpenOptions::new()
            .write(true)
            .open(&channel.paths().inbound)
            .unwrap();
        writeln!(emulator, "data_1#distance").unwrap();
        writeln!(emulator, "_56|score_0!").unwrap();
        writeln!(emulator, "ready_1!").unwrap();

        assert!(wait_until(|| recorder.messages().len() == 2));
        assert_eq!(
            recorder.messages(),
            vec!["data_1#distance_56|score_0".to_string(), "ready_1".to_string()]
        );
        channel.close();
    }

    #[test]
    fn exit_sentinel_stops_listener_and_removes_inbound_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, recorder) = open_channel(dir.path(), 3);
        let inbound = channel.paths().inbound.clone();
        {
            let mut emulator = OpenOptions::new().write(true).open(&inbound).unwrap();
            writeln!(emulator, "exit!").unwrap();
        }
        assert!(wait_until(|| !channel.listener_alive()));
        assert!(!inbound.exists());
        assert!(recorder.messages().is_empty());

        assert!(channel.reattach_listener());
        assert!(wait_until(|| inbound.exists()));
        channel.close();
        assert!(!inbound.exists());
    }

    #[test]
    fn handler_error_stops_listener() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, recorder) = open_channel(dir.path(), 4);
        {
            let mut emulator = OpenOptions::new()
                .write(true)
                .open(&channel.paths().inbound)
                .unwrap();
            writeln!(emulator, "boom!").unwrap();
        }
        assert!(wait_until(|| !channel.listener_alive()));
        assert!(recorder.messages().is_empty());
        channel.close();
    }

    #[test]
    fn send_without_reader_is_retried_on_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = open_channel(dir.path(), 5);
        assert!(!channel.send("commands_0#0,0,0,0,0,0"));

        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&channel.paths().outbound)
            .unwrap();
        assert!(channel.send("commands_0#0,0,0,1,0,0"));

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).unwrap();
        assert_eq!(line, "commands_0#0,0,0,1,0,0\n");
        channel.close();
    }

    #[test]
    fn reattach_is_refused_while_listener_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = open_channel(dir.path(), 6);
        assert!(channel.listener_alive());
        assert!(!channel.reattach_listener());
        channel.close();
        assert!(!channel.reattach_listener());
    }
}
