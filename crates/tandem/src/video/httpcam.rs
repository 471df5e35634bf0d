//! Client for IP webcams serving multipart MJPEG over HTTP.

use std::{
    io::{self, prelude::*, BufReader},
    net::{SocketAddr, TcpStream},
};

use anyhow::bail;
use image::{ImageFormat, RgbImage};

use super::Capture;

pub struct HttpStream {
    stream: BufReader<TcpStream>,
    boundary: String,
}

impl HttpStream {
    /// Connects to `addr` and requests the stream at `path`.
    pub fn connect(addr: SocketAddr, path: &str) -> anyhow::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        write!(stream, "GET {path} HTTP/1.1\r\nHost: {}\r\n\r\n", addr.ip())?;
        Self::from_reader(BufReader::new(stream))
    }

    fn from_reader(mut stream: BufReader<TcpStream>) -> anyhow::Result<Self> {
        let mut line = String::new();
        stream.read_line(&mut line)?;
        log::trace!("response: {}", line.trim());
        if !line.starts_with("HTTP/1.1 200") && !line.starts_with("HTTP/1.0 200") {
            bail!("received unexpected response: {}", line.trim());
        }

        let mut boundary = None;
        loop {
            line.clear();
            if stream.read_line(&mut line)? == 0 || line == "\r\n" {
                break;
            }
            log::trace!("response header: {}", line.trim());
            let Some((name, value)) = line.split_once(':') else {
                bail!("malformed HTTP response header: {}", line.trim());
            };
            if name.eq_ignore_ascii_case("Content-Type") {
                boundary = Some(parse_boundary(value)?);
            }
        }

        let Some(boundary) = boundary else {
            bail!("missing `Content-Type` header");
        };

        let mut this = Self { stream, boundary };
        if !this.read_until_boundary()? {
            bail!("stream ended before the first part");
        }
        Ok(this)
    }

    /// Reads and decodes the next JPEG part. Returns [`None`] when the server closes the stream.
    pub fn read(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let mut length = None;
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if line == "\r\n" {
                break;
            }
            log::trace!("multipart header: {}", line.trim());
            let Some((key, value)) = line.split_once(':') else {
                bail!("malformed multipart header: {}", line.trim());
            };
            if key.eq_ignore_ascii_case("Content-Type") && value.trim() != "image/jpeg" {
                bail!(
                    "unexpected Content-Type: expected image/jpeg, got {}",
                    value.trim()
                );
            }
            if key.eq_ignore_ascii_case("Content-Length") {
                length = Some(value.trim().parse::<usize>()?);
            }
        }

        let Some(length) = length else {
            bail!("missing Content-Length header");
        };
        let mut buf = vec![0; length];
        self.stream.read_exact(&mut buf)?;
        self.read_until_boundary()?;

        let image = image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)?;
        Ok(Some(image.into_rgb8()))
    }

    /// Skips to the next boundary line. Returns `false` if the stream ended first.
    fn read_until_boundary(&mut self) -> io::Result<bool> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line)? == 0 {
                return Ok(false);
            }
            if line.trim() == self.boundary {
                return Ok(true);
            }
        }
    }
}

impl Capture for HttpStream {
    fn capture(&mut self) -> anyhow::Result<Option<RgbImage>> {
        self.read()
    }
}

/// Extracts the part boundary from a `multipart/x-mixed-replace` content type.
///
/// The returned boundary includes the leading `--`.
fn parse_boundary(content_type: &str) -> anyhow::Result<String> {
    let Some((mime, params)) = content_type.trim().split_once(';') else {
        bail!("malformed Content-Type header: {}", content_type.trim());
    };
    if mime.trim() != "multipart/x-mixed-replace" {
        bail!("malformed Content-Type header: unexpected mime type {mime}");
    }
    let Some(boundary) = params.trim().strip_prefix("boundary=") else {
        bail!("malformed Content-Type header (missing boundary)");
    };
    let boundary = boundary.trim_matches('"');
    // Some servers (Droidcam) already include the `--`.
    if boundary.starts_with("--") {
        Ok(boundary.to_string())
    } else {
        Ok(format!("--{boundary}"))
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use image::{codecs::jpeg::JpegEncoder, Rgb};

    use super::*;

    #[test]
    fn boundary() {
        assert_eq!(
            parse_boundary(" multipart/x-mixed-replace;boundary=frame\r\n").unwrap(),
            "--frame"
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=--dcmjpeg").unwrap(),
            "--dcmjpeg"
        );
        assert!(parse_boundary("image/jpeg").is_err());
        assert!(parse_boundary("text/html; charset=utf-8").is_err());
    }

    #[test]
    fn reads_parts_until_close() {
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg)
            .encode_image(&RgbImage::from_pixel(8, 6, Rgb([200, 10, 10])))
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            assert_eq!(request, "GET /mjpg HTTP/1.1\r\n");
            // Consume the rest of the request so closing does not reset the connection.
            while request != "\r\n" {
                request.clear();
                reader.read_line(&mut request).unwrap();
            }

            write!(
                conn,
                "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary=part\r\n\r\n--part\r\n"
            )
            .unwrap();
            for _ in 0..2 {
                write!(
                    conn,
                    "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    jpeg.len()
                )
                .unwrap();
                conn.write_all(&jpeg).unwrap();
                write!(conn, "\r\n--part\r\n").unwrap();
            }
        });

        let mut stream = HttpStream::connect(addr, "/mjpg").unwrap();
        for _ in 0..2 {
            let image = stream.capture().unwrap().unwrap();
            assert_eq!(image.dimensions(), (8, 6));
        }
        server.join().unwrap();
        assert!(stream.capture().unwrap().is_none());
    }
}
