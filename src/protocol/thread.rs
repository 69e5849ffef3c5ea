use std::{
    io::{self, ErrorKind, Read},
    sync::Weak,
    thread,
};

use log::{debug, trace};

use super::{connection::Shared, transport::SocketReader};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Background thread that owns the receive half of one connection.
#[derive(Debug)]
pub(crate) struct ReaderThread {
    thread: thread::JoinHandle<()>,
}

impl ReaderThread {
    pub fn spawn(shared: Weak<Shared>, socket: SocketReader, name: String) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(shared, socket))?;
        Ok(Self { thread })
    }

    pub fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    pub fn join(self) {
        let name = self.thread.thread().name().unwrap_or("reader").to_string();
        if self.thread.join().is_err() {
            debug!("{name} panicked");
        }
    }
}

fn run(shared: Weak<Shared>, mut socket: SocketReader) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        // Blocks until data arrives or the socket is shut down.
        let read = socket.read(&mut chunk);

        // Connection handles are all gone; nobody is left to read for.
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match read {
            Ok(0) => {
                debug!("server closed the connection");
                shared.handle_close();
                break;
            }
            Ok(n) => {
                trace!("read {n} bytes");
                if !shared.handle_data(&chunk[..n]) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                shared.handle_error(e);
                break;
            }
        }
    }

    debug!("reader thread exiting");
}
