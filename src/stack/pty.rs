//! PTY bridge for the interactive console.
//!
//! Platform-gated: on Linux the console attaches a `docker attach` child to
//! the slave side of a pseudo-terminal pair while the server owns the
//! master. Elsewhere the exec endpoint reports 501.

use crate::limits::{DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS, MAX_PTY_COLS, MAX_PTY_ROWS};

#[derive(Debug, Clone, Copy)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_PTY_COLS,
            rows: DEFAULT_PTY_ROWS,
        }
    }
}

impl TerminalSize {
    /// Initial geometry from query parameters; out-of-range values fall
    /// back to the defaults.
    pub fn from_query(cols: Option<i64>, rows: Option<i64>) -> Self {
        let mut size = Self::default();
        if let Some(cols) = cols {
            if cols > 0 && cols <= MAX_PTY_COLS as i64 {
                size.cols = cols as u16;
            }
        }
        if let Some(rows) = rows {
            if rows > 0 && rows <= MAX_PTY_ROWS as i64 {
                size.rows = rows as u16;
            }
        }
        size
    }
}

/// Map a start failure onto a message safe to hand to the console client.
pub fn describe_exec_start_error(err: &anyhow::Error) -> &'static str {
    let lower = format!("{err:#}").to_lowercase();
    if lower.contains("not supported on this worker platform") {
        "interactive console PTY is not available on this worker"
    } else if lower.contains("pty open failed") {
        "interactive console PTY could not be opened on this worker runtime"
    } else if lower.contains("pty resize failed") {
        "interactive console PTY resize failed on this worker runtime"
    } else if lower.contains("docker attach launch failed") {
        "failed to launch docker attach for interactive console"
    } else if lower.contains("no running container found") || lower.contains("is not running") {
        "interactive console is unavailable because the service container is not running"
    } else {
        "failed to start interactive console session"
    }
}

#[cfg(target_os = "linux")]
pub use linux::{pty_supported, start_compose_attach_pty, PtyMaster};

#[cfg(not(target_os = "linux"))]
pub use unsupported::{pty_supported, start_compose_attach_pty, PtyMaster};

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::path::Path;
    use std::process::Stdio;

    use anyhow::{anyhow, bail, Context, Result};
    use nix::pty::{openpty, Winsize};
    use tokio::io::unix::AsyncFd;
    use tokio::process::{Child, Command};

    use crate::limits::{COMPOSE_TIMEOUT, MAX_PTY_COLS, MAX_PTY_ROWS};
    use crate::stack::compose::run_compose_within;

    use super::TerminalSize;

    pub fn pty_supported() -> bool {
        true
    }

    /// The master side of the console PTY. Reads and writes go through an
    /// `AsyncFd` wrapper over the non-blocking fd.
    pub struct PtyMaster {
        fd: AsyncFd<OwnedFd>,
    }

    impl PtyMaster {
        fn from_owned(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(&fd)?;
            Ok(Self { fd: AsyncFd::new(fd)? })
        }

        pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(Ok(n)) => return Ok(n),
                    // EIO on a pty master means the slave side is gone.
                    Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => return Ok(0),
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
        }

        pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
            while !data.is_empty() {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(inner.get_ref().as_raw_fd(), data.as_ptr().cast(), data.len())
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(Ok(n)) => data = &data[n..],
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
            Ok(())
        }

        pub fn resize(&self, size: TerminalSize) -> io::Result<()> {
            set_winsize(self.fd.get_ref(), size)
        }
    }

    /// Resolve the service container, validate it accepts an attach, open
    /// the PTY pair and spawn `docker attach` on the slave. A sandbox that
    /// refuses controlling-TTY acquisition gets one retry without it.
    pub async fn start_compose_attach_pty(
        stack_dir: &Path,
        service: &str,
        size: TerminalSize,
    ) -> Result<(Child, PtyMaster)> {
        let container_id = resolve_service_container_id(stack_dir, service).await?;
        validate_attach_container_io(&container_id).await?;

        match spawn_docker_attach(&container_id, size, true) {
            Ok(pair) => Ok(pair),
            Err(err) if should_retry_without_ctty(&err) => spawn_docker_attach(&container_id, size, false)
                .map_err(|err| anyhow!("docker attach launch failed: {err:#}")),
            Err(err) => Err(anyhow!("docker attach launch failed: {err:#}")),
        }
    }

    fn spawn_docker_attach(container_id: &str, size: TerminalSize, use_ctty: bool) -> Result<(Child, PtyMaster)> {
        let (master, slave) = open_pty(size)?;

        let mut cmd = Command::new("docker");
        cmd.args(["attach", "--sig-proxy=false", container_id]);
        cmd.env("TERM", "xterm-256color");
        cmd.stdin(Stdio::from(slave.try_clone().context("pty open failed")?));
        cmd.stdout(Stdio::from(slave.try_clone().context("pty open failed")?));
        cmd.stderr(Stdio::from(slave));
        cmd.kill_on_drop(true);

        if use_ctty {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    // Stdin is the slave at this point.
                    if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn()?;
        let master = PtyMaster::from_owned(master).context("pty open failed")?;
        Ok((child, master))
    }

    fn open_pty(size: TerminalSize) -> Result<(OwnedFd, OwnedFd)> {
        let winsize = Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let termios: Option<&nix::sys::termios::Termios> = None;
        let pair = openpty(Some(&winsize), termios).context("pty open failed")?;
        Ok((pair.master, pair.slave))
    }

    fn set_winsize(fd: &OwnedFd, size: TerminalSize) -> io::Result<()> {
        if size.cols == 0 || size.rows == 0 || size.cols > MAX_PTY_COLS || size.rows > MAX_PTY_ROWS {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "terminal size exceeds limits"));
        }
        let winsize = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn should_retry_without_ctty(err: &anyhow::Error) -> bool {
        let lower = format!("{err:#}").to_lowercase();
        lower.contains("setctty") || lower.contains("operation not permitted")
    }

    async fn resolve_service_container_id(stack_dir: &Path, service: &str) -> Result<String> {
        let output = run_compose_within(stack_dir, &["ps", "-q", service], COMPOSE_TIMEOUT)
            .await
            .context("compose service container lookup failed")?;

        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no running container found for service {service:?}"))
    }

    async fn validate_attach_container_io(container_id: &str) -> Result<()> {
        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{.State.Running}} {{.Config.OpenStdin}} {{.Config.Tty}}",
                container_id,
            ])
            .kill_on_drop(true)
            .output()
            .await
            .context("container inspect failed")?;

        if !output.status.success() {
            bail!("container inspect failed");
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() < 3 {
            bail!("container inspect returned unexpected output");
        }
        if !fields[0].eq_ignore_ascii_case("true") {
            bail!("container is not running");
        }
        if !fields[1].eq_ignore_ascii_case("true") {
            bail!("container stdin is disabled (stdin_open=false)");
        }
        if !fields[2].eq_ignore_ascii_case("true") {
            bail!("container tty is disabled (tty=false)");
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_retry_classification() {
            assert!(should_retry_without_ctty(&anyhow!("Setctty failed")));
            assert!(should_retry_without_ctty(&anyhow!("ioctl: Operation not permitted")));
            assert!(!should_retry_without_ctty(&anyhow!("no such container")));
        }

        #[tokio::test]
        async fn test_pty_round_trip() {
            let (master, slave) = open_pty(TerminalSize::default()).unwrap();
            let master = PtyMaster::from_owned(master).unwrap();

            // Slave output reaches the master without line buffering.
            let n = unsafe { libc::write(slave.as_raw_fd(), b"ping".as_ptr().cast(), 4) };
            assert_eq!(n, 4);

            let mut buf = [0u8; 16];
            let n = master.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
        }

        #[tokio::test]
        async fn test_resize_bounds() {
            let (master, _slave) = open_pty(TerminalSize::default()).unwrap();
            let master = PtyMaster::from_owned(master).unwrap();
            assert!(master.resize(TerminalSize { cols: 80, rows: 24 }).is_ok());
            assert!(master.resize(TerminalSize { cols: 0, rows: 24 }).is_err());
            assert!(master.resize(TerminalSize { cols: 501, rows: 24 }).is_err());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use std::io;
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use tokio::process::Child;

    use super::TerminalSize;

    pub fn pty_supported() -> bool {
        false
    }

    pub struct PtyMaster;

    impl PtyMaster {
        pub async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub async fn write_all(&self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        pub fn resize(&self, _size: TerminalSize) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    pub async fn start_compose_attach_pty(
        _stack_dir: &Path,
        _service: &str,
        _size: TerminalSize,
    ) -> Result<(Child, PtyMaster)> {
        Err(anyhow!("interactive console is not supported on this worker platform"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_size_from_query() {
        let size = TerminalSize::from_query(None, None);
        assert_eq!((size.cols, size.rows), (DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS));

        let size = TerminalSize::from_query(Some(80), Some(24));
        assert_eq!((size.cols, size.rows), (80, 24));

        // Out-of-range values fall back rather than erroring.
        let size = TerminalSize::from_query(Some(0), Some(9999));
        assert_eq!((size.cols, size.rows), (DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS));
    }

    #[test]
    fn test_describe_exec_start_error() {
        let err = anyhow::anyhow!("no running container found for service \"game\"");
        assert!(describe_exec_start_error(&err).contains("not running"));

        let err = anyhow::anyhow!("pty open failed: boom");
        assert!(describe_exec_start_error(&err).contains("could not be opened"));

        let err = anyhow::anyhow!("something else entirely");
        assert_eq!(describe_exec_start_error(&err), "failed to start interactive console session");
    }
}
