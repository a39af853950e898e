// Pipe endpoint serving one connection at a time.
//
// Windows: a single named pipe instance (duplex, byte mode) that is
// disconnected after each exchange and reconnected for the next one.
// Unix: a Unix-domain socket listener; each exchange gets its own stream.

use std::io;

#[cfg(windows)]
mod imp {
    use super::io;
    use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};

    pub type PipeStream = NamedPipeServer;

    pub fn address_for(name: &str) -> String {
        format!(r"\\.\pipe\{}", name)
    }

    pub struct PipeEndpoint {
        address: String,
        server: NamedPipeServer,
        connected: bool,
    }

    impl PipeEndpoint {
        /// Must be called within a Tokio runtime context.
        pub fn bind(name: &str) -> io::Result<Self> {
            let address = address_for(name);
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .access_inbound(true)
                .access_outbound(true)
                .pipe_mode(PipeMode::Byte)
                .create(&address)?;

            Ok(Self {
                address,
                server,
                connected: false,
            })
        }

        pub fn address(&self) -> &str {
            &self.address
        }

        pub async fn accept(&mut self) -> io::Result<&mut PipeStream> {
            self.server.connect().await?;
            self.connected = true;
            Ok(&mut self.server)
        }

        pub fn disconnect(&mut self) -> io::Result<()> {
            if self.connected {
                self.connected = false;
                self.server.disconnect()?;
            }
            Ok(())
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::io;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    pub type PipeStream = UnixStream;

    pub fn address_for(name: &str) -> String {
        socket_path(name).to_string_lossy().into_owned()
    }

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}.sock", name))
    }

    pub struct PipeEndpoint {
        address: String,
        path: PathBuf,
        listener: UnixListener,
        stream: Option<UnixStream>,
    }

    impl PipeEndpoint {
        /// Must be called within a Tokio runtime context.
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = socket_path(name);
            let listener = UnixListener::bind(&path)?;

            Ok(Self {
                address: path.to_string_lossy().into_owned(),
                path,
                listener,
                stream: None,
            })
        }

        pub fn address(&self) -> &str {
            &self.address
        }

        pub async fn accept(&mut self) -> io::Result<&mut PipeStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(self.stream.insert(stream))
        }

        pub fn disconnect(&mut self) -> io::Result<()> {
            self.stream.take();
            Ok(())
        }
    }

    impl Drop for PipeEndpoint {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub use imp::{address_for, PipeEndpoint, PipeStream};
