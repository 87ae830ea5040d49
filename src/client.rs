use crate::paths::Paths;
use crate::protocol::{self, Request, Response};
use crate::sys;
use color_eyre::eyre::bail;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    if !sys::is_daemon_running(paths) {
        bail!("daemon is not running, start it with `lazyhost daemon`");
    }
    let mut stream = connect_with_retry(paths, 10, Duration::from_millis(200))?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let response = protocol::decode_response(&line)?;
    Ok(response)
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt >= retries => {
                bail!("failed to connect to daemon after {retries} attempts: {e}");
            }
            Err(_) => std::thread::sleep(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let err = send_request(&paths, &Request::Status).unwrap_err();
        assert!(err.to_string().contains("daemon is not running"));
    }

    #[test]
    fn test_connect_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let err = connect_with_retry(&paths, 2, Duration::from_millis(1)).unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
