//! The raw byte-stream hooks a session protects.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// The host transport's previously registered I/O hooks.
///
/// A [`Session`](crate::Session) owns its transport and calls these for every raw byte moved.
/// Reads may return fewer bytes than requested; `Ok(0)` means the peer closed the stream.
pub trait Transport {
    /// Connects to `host:port`. `endpoint` is the full address the host runtime was given.
    ///
    /// The default reports that the host registered no open hook.
    fn open(&mut self, endpoint: &str, host: &str, port: u16) -> io::Result<()> {
        let _ = (endpoint, host, port);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport has no open hook",
        ))
    }

    /// Writes bytes, returning how many were accepted.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads up to `buf.len()` bytes.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Closes the connection.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Address of the connected peer.
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport has no peer address",
        ))
    }

    /// Local address of the connection.
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport has no local address",
        ))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, endpoint: &str, host: &str, port: u16) -> io::Result<()> {
        (**self).open(endpoint, host, port)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// A blocking TCP transport.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    timeout: Option<Duration>,
}

impl TcpTransport {
    /// An unconnected transport; [`open`](Transport::open) connects it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an accepted socket.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            timeout: None,
        }
    }

    /// Sets the read/write timeout applied to the socket once connected.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not open"))
    }

    fn apply_timeout(&self, stream: &TcpStream) -> io::Result<()> {
        if let Some(timeout) = self.timeout {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, _endpoint: &str, host: &str, port: u16) -> io::Result<()> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            let attempt = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    self.apply_timeout(&stream)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {host}"),
            )
        }))
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self.stream()?;
        stream.write_all(buf)?;
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream()?;
        stream.read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_unopened_transport_reports_not_connected() {
        let mut transport = TcpTransport::new();
        let err = transport.send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_open_send_recv_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = TcpTransport::from_stream(stream);
            let mut buf = [0u8; 5];
            let mut read = 0;
            while read < buf.len() {
                read += transport.recv(&mut buf[read..]).unwrap();
            }
            transport.send(&buf).unwrap();
        });

        let mut transport = TcpTransport::new().with_timeout(Duration::from_secs(5));
        transport.open("127.0.0.1", "127.0.0.1", port).unwrap();
        assert_eq!(transport.send(b"hello").unwrap(), 5);

        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            read += transport.recv(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"hello");
        assert!(transport.peer_addr().unwrap().ip().is_loopback());

        server.join().unwrap();
        transport.close().unwrap();
        transport.close().unwrap();
    }
}
