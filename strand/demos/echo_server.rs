//! A TCP echo server with one fiber per connection.
//!
//! ```text
//! RUST_LOG=info STRAND_THREADS=4 cargo run --example echo_server -- 127.0.0.1:8080
//! ```

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use log::{info, warn};
use strand::net::{TcpListener, TcpStream};

fn serve(mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            info!("{peer} disconnected");
            return Ok(());
        }
        stream.write_all(&buf[..n])?;
    }
}

#[strand::main]
fn main() -> io::Result<()> {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr)?;
    info!("echo server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept()?;
        info!("accepted {peer}");
        strand::spawn(move || {
            if let Err(e) = serve(stream, peer) {
                warn!("{peer}: {e}");
            }
        });
    }
}
