//! Single-threaded socket poll loop
//!
//! `SocketPoll` owns a set of `StreamSocket`s and drives them with
//! `poll(2)`. One call to `poll()` is one iteration: timeouts are checked,
//! the kernel is waited on, deferred callbacks run, readiness is
//! dispatched and closed sockets are reaped.

use super::socket::StreamSocket;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type Callback = Box<dyn FnOnce()>;

/// A `poll(2)` reactor for one thread
pub struct SocketPoll {
    name: String,
    sockets: RefCell<Vec<Rc<StreamSocket>>>,
    new_sockets: RefCell<Vec<Rc<StreamSocket>>>,
    callbacks: RefCell<Vec<Callback>>,
    wakeup: [RawFd; 2],
    alive: Cell<bool>,
}

impl SocketPoll {
    /// Create a poll with its wakeup pipe.
    pub fn new(name: impl Into<String>) -> io::Result<Rc<Self>> {
        let mut fds: [RawFd; 2] = [-1; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = name.into();
        debug!(poll = %name, "created socket poll");
        Ok(Rc::new(SocketPoll {
            name,
            sockets: RefCell::new(Vec::new()),
            new_sockets: RefCell::new(Vec::new()),
            callbacks: RefCell::new(Vec::new()),
            wakeup: fds,
            alive: Cell::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Adopt a socket; it is polled from the next iteration on.
    pub fn insert_new_socket(&self, socket: Rc<StreamSocket>) {
        trace!(poll = %self.name, fd = socket.fd(), "inserting socket");
        self.new_sockets.borrow_mut().push(socket);
        self.wakeup();
    }

    /// Run `callback` at the start of the next iteration.
    pub fn add_callback(&self, callback: impl FnOnce() + 'static) {
        self.callbacks.borrow_mut().push(Box::new(callback));
        self.wakeup();
    }

    /// Interrupt a blocking `poll()`.
    pub fn wakeup(&self) {
        let byte = 1u8;
        let rc = unsafe { libc::write(self.wakeup[1], &byte as *const u8 as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a wakeup.
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(poll = %self.name, error = %err, "failed to wake up poll");
            }
        }
    }

    /// Number of sockets owned by the poll, including ones not yet adopted.
    pub fn socket_count(&self) -> usize {
        self.sockets.borrow().len() + self.new_sockets.borrow().len()
    }

    /// Close every socket and refuse further work.
    pub fn stop(&self) {
        debug!(poll = %self.name, "stopping socket poll");
        self.alive.set(false);
        let sockets: Vec<_> = self
            .sockets
            .borrow_mut()
            .drain(..)
            .chain(self.new_sockets.borrow_mut().drain(..))
            .collect();
        for socket in sockets {
            socket.shutdown_connection();
            socket.notify_disconnect();
        }
        self.callbacks.borrow_mut().clear();
    }

    fn adopt_new_sockets(&self) {
        let mut new_sockets = std::mem::take(&mut *self.new_sockets.borrow_mut());
        if !new_sockets.is_empty() {
            self.sockets.borrow_mut().append(&mut new_sockets);
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe { libc::read(self.wakeup[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }

    fn run_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        for callback in callbacks {
            callback();
        }
    }

    fn reap_closed(&self) {
        let mut closed = Vec::new();
        self.sockets.borrow_mut().retain(|socket| {
            if socket.is_open() {
                true
            } else {
                closed.push(socket.clone());
                false
            }
        });
        for socket in closed {
            trace!(poll = %self.name, fd = socket.fd(), "removing closed socket");
            socket.notify_disconnect();
        }
    }

    /// Run one iteration, waiting at most `timeout` for events.
    ///
    /// Returns the number of sockets that had events.
    pub fn poll(&self, timeout: Duration) -> io::Result<usize> {
        if !self.alive.get() {
            return Ok(0);
        }

        self.adopt_new_sockets();
        self.reap_closed();

        let now = Instant::now();
        let sockets: Vec<Rc<StreamSocket>> = self.sockets.borrow().clone();
        for socket in &sockets {
            if let Some(handler) = socket.handler() {
                if handler.check_timeout(now) {
                    trace!(poll = %self.name, fd = socket.fd(), "socket timed out");
                }
            }
        }

        let mut timeout_max = timeout;
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(sockets.len() + 1);
        for socket in &sockets {
            fds.push(libc::pollfd {
                fd: socket.fd(),
                events: socket.poll_events(now, &mut timeout_max),
                revents: 0,
            });
        }
        fds.push(libc::pollfd {
            fd: self.wakeup[0],
            events: libc::POLLIN,
            revents: 0,
        });

        if !self.callbacks.borrow().is_empty() || !self.new_sockets.borrow().is_empty() {
            timeout_max = Duration::ZERO;
        }

        let timeout_ms = timeout_max.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        if let Some(wakeup) = fds.last() {
            if wakeup.revents != 0 {
                self.drain_wakeup();
            }
        }

        self.run_callbacks();

        let mut events = 0;
        for (socket, pfd) in sockets.iter().zip(fds.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            events += 1;
            socket.handle_poll(pfd.revents);
        }

        self.reap_closed();
        Ok(events)
    }
}

impl Drop for SocketPoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup[0]);
            libc::close(self.wakeup[1]);
        }
    }
}

impl std::fmt::Debug for SocketPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPoll")
            .field("name", &self.name)
            .field("sockets", &self.socket_count())
            .field("alive", &self.alive.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::tests::NullHandler;
    use crate::net::socket::test_pair;
    use std::io::Write;

    #[test]
    fn test_callbacks_run_on_next_iteration() {
        let poll = SocketPoll::new("test").unwrap();
        let ran = Rc::new(Cell::new(0));
        let counter = ran.clone();
        poll.add_callback(move || counter.set(counter.get() + 1));
        assert_eq!(ran.get(), 0);

        poll.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(ran.get(), 1);

        poll.poll(Duration::from_millis(1)).unwrap();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_wakeup_interrupts_poll() {
        let poll = SocketPoll::new("wakeup").unwrap();
        poll.wakeup();
        let start = Instant::now();
        poll.poll(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_closed_socket_reaped_once() {
        let poll = SocketPoll::new("reap").unwrap();
        let handler = Rc::new(NullHandler::default());
        let (socket, mut peer) = test_pair(handler.clone());
        poll.insert_new_socket(socket.clone());
        assert_eq!(poll.socket_count(), 1);

        peer.write_all(b"x").unwrap();
        drop(peer);

        for _ in 0..20 {
            poll.poll(Duration::from_millis(50)).unwrap();
            if poll.socket_count() == 0 {
                break;
            }
        }
        assert_eq!(poll.socket_count(), 0);
        assert!(!socket.is_open());
        assert_eq!(handler.disconnected.get(), 1);
    }

    #[test]
    fn test_stop_disconnects_all() {
        let poll = SocketPoll::new("stop").unwrap();
        let handler = Rc::new(NullHandler::default());
        let (socket, _peer) = test_pair(handler.clone());
        poll.insert_new_socket(socket);
        poll.stop();
        assert!(!poll.is_alive());
        assert_eq!(poll.socket_count(), 0);
        assert_eq!(handler.disconnected.get(), 1);
        assert_eq!(poll.poll(Duration::from_millis(1)).unwrap(), 0);
    }
}
