use std::{
    io,
    net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket},
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use sluice_format::{NetParms, Protocol};
use tracing::{debug, warn};

use crate::itcp;

/// Ask the kernel for larger socket buffers; at multi-Gbps the default
/// SO_RCVBUF drops packets long before the reader thread is the problem.
/// Failure only gets logged, the transfer still works at reduced margin.
pub fn set_socket_bufs(fd: RawFd, size: usize) {
    let size = size as libc::c_int;
    for (opt, name) in [(libc::SO_SNDBUF, "SO_SNDBUF"), (libc::SO_RCVBUF, "SO_RCVBUF")] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::addr_of!(size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(?name, size, err = ?io::Error::last_os_error(), "setsockopt failed");
        }
    }
}

/// Read timeout on the data socket so a stalled sender cannot pin a reader
/// stage forever; the stage re-checks its cancel flag on every timeout.
const DATA_RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Outbound endpoint of a network writer stage.
#[derive(Debug)]
pub enum DataSink {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Inbound endpoint of a network reader stage. TCP variants carry the
/// listener; the stage accepts the one data connection itself so the
/// command reply does not wait on the remote end.
pub enum DataSource {
    TcpListen { listener: TcpListener, expect_preamble: bool },
    Udp(UdpSocket),
}

/// Open the sending end for the configured protocol towards `host`.
///
/// `udt` is carried by an external transport library that is not part of
/// this build; asking for it reports exactly that.
pub fn connect_sink(np: &NetParms, host: &str, itcp_id: &str) -> io::Result<DataSink> {
    let addr = (host, np.port);
    match np.protocol {
        Protocol::Tcp => Ok(DataSink::Tcp(tcp_connect(addr, np.sockbuf)?)),
        Protocol::Itcp => {
            let mut stream = tcp_connect(addr, np.sockbuf)?;
            itcp::write_preamble(&mut stream, itcp_id)?;
            Ok(DataSink::Tcp(stream))
        }
        Protocol::Udp | Protocol::Udps => {
            let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            set_socket_bufs(sock.as_raw_fd(), np.sockbuf);
            sock.connect(addr)?;
            debug!(peer = %sock.peer_addr()?, proto = %np.protocol, "data sink connected");
            Ok(DataSink::Udp(sock))
        }
        Protocol::Udt => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "udt transport not linked into this build",
        )),
    }
}

/// Open the receiving end for the configured protocol.
pub fn open_source(np: &NetParms, local: Option<IpAddr>) -> io::Result<DataSource> {
    let ip = local.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    match np.protocol {
        Protocol::Tcp | Protocol::Itcp => {
            let listener = TcpListener::bind((ip, np.port))?;
            debug!(addr = %listener.local_addr()?, proto = %np.protocol, "data source listening");
            Ok(DataSource::TcpListen {
                listener,
                expect_preamble: np.protocol == Protocol::Itcp,
            })
        }
        Protocol::Udp | Protocol::Udps => {
            let sock = UdpSocket::bind((ip, np.port))?;
            set_socket_bufs(sock.as_raw_fd(), np.sockbuf);
            sock.set_read_timeout(Some(DATA_RECV_TIMEOUT))?;
            debug!(addr = %sock.local_addr()?, proto = %np.protocol, "data source bound");
            Ok(DataSource::Udp(sock))
        }
        Protocol::Udt => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "udt transport not linked into this build",
        )),
    }
}

fn tcp_connect(addr: (&str, u16), sockbuf: usize) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    set_socket_bufs(stream.as_raw_fd(), sockbuf);
    debug!(peer = %stream.peer_addr()?, "data sink connected");
    Ok(stream)
}

impl DataSource {
    /// Block until the single data connection (TCP flavours) is there, or
    /// hand back the bound socket (UDP flavours).
    pub fn establish(self) -> io::Result<EstablishedSource> {
        match self {
            Self::TcpListen { listener, expect_preamble } => {
                let (mut stream, peer) = listener.accept()?;
                if expect_preamble {
                    // before the timeout goes on: a slow controller must
                    // not have its preamble cut short
                    let fields = itcp::read_preamble(&mut stream)?;
                    debug!(?fields, %peer, "itcp preamble");
                }
                stream.set_read_timeout(Some(DATA_RECV_TIMEOUT))?;
                debug!(%peer, "data connection accepted");
                Ok(EstablishedSource::Tcp(stream))
            }
            Self::Udp(sock) => Ok(EstablishedSource::Udp(sock)),
        }
    }
}

pub enum EstablishedSource {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[cfg(test)]
mod test {
    use super::*;

    fn loopback_parms(proto: Protocol, port: u16) -> NetParms {
        NetParms { protocol: proto, port, ..NetParms::default() }
    }

    #[test]
    fn udp_sink_and_source_pass_datagrams() {
        let src = open_source(&loopback_parms(Protocol::Udp, 0), None).unwrap();
        let DataSource::Udp(rx) = &src else { panic!("udp expected") };
        let port = rx.local_addr().unwrap().port();

        let sink =
            connect_sink(&loopback_parms(Protocol::Udp, port), "127.0.0.1", "").unwrap();
        let DataSink::Udp(tx) = &sink else { panic!("udp expected") };
        tx.send(b"payload").unwrap();

        let EstablishedSource::Udp(rx) = src.establish().unwrap() else { unreachable!() };
        let mut buf = [0u8; 16];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn udt_reports_unsupported() {
        let err = connect_sink(&loopback_parms(Protocol::Udt, 1), "127.0.0.1", "")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
