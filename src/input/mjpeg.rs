// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! HTTP MJPEG 网络摄像头输入
//!
//! 解析 `multipart/x-mixed-replace` 流, 每个分段为一张 JPEG. 连接中断后在下一次
//! `next_frame` 时重连, 期间的失败都作为暂时失败返回.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use tracing::{debug, info};

use super::{resize_rgb, CaptureError, FrameSource};

type BodyReader = BufReader<Box<dyn Read + Send + Sync + 'static>>;

/// 单帧 JPEG 上限, 防止损坏的 Content-Length 撑爆内存
const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    size: (u32, u32),
    stream: Option<(BodyReader, String)>, // (响应体, 分隔符 `--xxx`)
    reconnects: u64,
}

impl MjpegSource {
    /// 连接摄像头; 启动时连不上视为不可用
    pub fn open(url: &str, size: (u32, u32)) -> Result<Self, CaptureError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(5))
            .build();

        let mut source = Self {
            url: url.to_string(),
            agent,
            size,
            stream: None,
            reconnects: 0,
        };
        let stream = source.connect().map_err(|reason| CaptureError::Open {
            uri: url.to_string(),
            reason,
        })?;
        source.stream = Some(stream);
        info!("MJPEG 摄像头连接成功: {}", url);
        Ok(source)
    }

    fn connect(&self) -> Result<(BodyReader, String), String> {
        let response = self.agent.get(&self.url).call().map_err(|e| e.to_string())?;
        let content_type = response
            .header("Content-Type")
            .ok_or_else(|| "missing Content-Type header".to_string())?;
        let boundary = parse_boundary(content_type)?;

        let mut reader: BodyReader = BufReader::new(response.into_reader());
        read_until_boundary(&mut reader, &boundary).map_err(|e| e.to_string())?;
        Ok((reader, boundary))
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        if self.stream.is_none() {
            let stream = self.connect().map_err(CaptureError::Transient)?;
            self.reconnects += 1;
            debug!("MJPEG 重连成功 (#{})", self.reconnects);
            self.stream = Some(stream);
        }

        let Some((reader, boundary)) = self.stream.as_mut() else {
            return Err(CaptureError::transient("not connected"));
        };
        match read_part(reader, boundary) {
            Ok(jpeg) => Ok(jpeg),
            Err(e) => {
                self.stream = None;
                Err(CaptureError::transient(e))
            }
        }
    }
}

impl FrameSource for MjpegSource {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let jpeg = self.read_jpeg()?;
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .map_err(CaptureError::transient)?
            .to_rgb8();
        resize_rgb(image, self.size.0, self.size.1).map_err(CaptureError::transient)
    }
}

/// 从 `multipart/x-mixed-replace; boundary=frame` 中取出分隔符 (带 `--` 前缀)
fn parse_boundary(content_type: &str) -> Result<String, String> {
    let Some((mime, params)) = content_type.split_once(';') else {
        return Err(format!("malformed Content-Type header: {content_type}"));
    };
    if !mime.trim().eq_ignore_ascii_case("multipart/x-mixed-replace") {
        return Err(format!("unexpected mime type {}", mime.trim()));
    }
    let boundary = params
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("boundary="))
        .next()
        .ok_or_else(|| "missing multipart boundary".to_string())?
        .trim_matches('"');
    // 部分摄像头在 boundary 参数里已经带了 `--`
    if boundary.starts_with("--") {
        Ok(boundary.to_string())
    } else {
        Ok(format!("--{boundary}"))
    }
}

fn read_until_boundary<R: BufRead>(reader: &mut R, boundary: &str) -> std::io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if line.trim() == boundary {
            return Ok(());
        }
    }
}

/// 读取一个分段 (调用时流已位于分隔符之后), 返回 JPEG 字节并前进到下一个分隔符
fn read_part<R: BufRead>(reader: &mut R, boundary: &str) -> Result<Vec<u8>, String> {
    let mut length = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).map_err(|e| e.to_string())? == 0 {
            return Err("stream ended".to_string());
        }
        if line.trim().is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(format!("malformed part header: {}", line.trim()));
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            length = value.trim().parse::<usize>().ok();
        }
    }

    match length {
        Some(len) if len <= MAX_PART_BYTES => {
            let mut buf = vec![0; len];
            reader.read_exact(&mut buf).map_err(|e| e.to_string())?;
            read_until_boundary(reader, boundary).map_err(|e| e.to_string())?;
            Ok(buf)
        }
        Some(len) => Err(format!("part too large: {len} bytes")),
        // 无 Content-Length: 逐行读取直到下一个分隔符
        None => {
            let mut buf = Vec::new();
            let mut chunk = Vec::new();
            loop {
                chunk.clear();
                if reader.read_until(b'\n', &mut chunk).map_err(|e| e.to_string())? == 0 {
                    return Err("stream ended".to_string());
                }
                if chunk.trim_ascii() == boundary.as_bytes() {
                    break;
                }
                buf.extend_from_slice(&chunk);
                if buf.len() > MAX_PART_BYTES {
                    return Err("part too large".to_string());
                }
            }
            while matches!(buf.last(), Some(b'\r' | b'\n')) {
                buf.pop();
            }
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_boundary() {
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=frame").unwrap(),
            "--frame"
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace;boundary=\"--myboundary\"").unwrap(),
            "--myboundary"
        );
        assert!(parse_boundary("image/jpeg").is_err());
        assert!(parse_boundary("multipart/x-mixed-replace; charset=utf-8").is_err());
    }

    #[test]
    fn test_read_parts_with_content_length() {
        let body = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nABCD\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 2\r\n\r\nEF\r\n--frame\r\n";
        let mut reader = Cursor::new(&body[..]);
        read_until_boundary(&mut reader, "--frame").unwrap();
        assert_eq!(read_part(&mut reader, "--frame").unwrap(), b"ABCD");
        assert_eq!(read_part(&mut reader, "--frame").unwrap(), b"EF");
        assert!(read_part(&mut reader, "--frame").is_err());
    }

    #[test]
    fn test_read_part_without_content_length() {
        let body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n\r\n--frame\r\n";
        let mut reader = Cursor::new(&body[..]);
        read_until_boundary(&mut reader, "--frame").unwrap();
        assert_eq!(read_part(&mut reader, "--frame").unwrap(), b"JPEGDATA");
    }

    #[test]
    fn test_open_unreachable_camera_is_fatal() {
        let result = MjpegSource::open("http://127.0.0.1:1/video", (640, 360));
        assert!(matches!(result, Err(CaptureError::Open { .. })));
    }
}
