// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! HTTP 接口 (actix-web, 独立线程)
//!
//! - `GET /video_feed`:     `multipart/x-mixed-replace` 标注后的 MJPEG 流
//! - `GET /parking_status`: 最近一次车位统计 JSON

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{anyhow, Context, Result};
use async_stream::stream;
use crossbeam_channel::bounded;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, Instrument};

use crate::pipeline::{FrameSlot, StatusRegistry};

pub const BOUNDARY: &str = "frame";
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP 处理器共享状态
#[derive(Clone)]
pub struct ServerState {
    pub status: Arc<StatusRegistry>,
    pub frames: FrameSlot,
}

/// 服务线程句柄
pub struct StreamServer {
    addrs: Vec<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamServer {
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// 通知服务停止并等待线程退出
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 路由表 (服务与测试共用)
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed", web::get().to(video_feed))
        .route("/parking_status", web::get().to(parking_status));
}

/// 在独立线程中启动 HTTP 服务; 端口绑定失败时返回错误
pub fn spawn_server(host: &str, port: u16, state: ServerState) -> Result<StreamServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = bounded::<std::io::Result<Vec<SocketAddr>>>(1);
    let bind_addr = (host.to_string(), port);

    let handle = std::thread::Builder::new()
        .name("http-server".into())
        .spawn(move || {
            let span = info_span!("server", host = %bind_addr.0, port = bind_addr.1);
            let result = actix_web::rt::System::new().block_on(
                async move {
                    let server = HttpServer::new(move || {
                        App::new()
                            .app_data(web::Data::new(state.clone()))
                            .configure(routes)
                    })
                    .shutdown_timeout(2)
                    .bind(bind_addr.clone());

                    let server = match server {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };
                    let _ = ready_tx.send(Ok(server.addrs()));
                    let server = server.run();

                    let srv_handle = server.handle();
                    actix_web::rt::spawn(async move {
                        let _ = shutdown_rx.await;
                        srv_handle.stop(true).await;
                    });

                    server.await
                }
                .instrument(span),
            );
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
        })
        .context("failed to spawn HTTP server thread")?;

    let addrs = match ready_rx.recv_timeout(START_TIMEOUT) {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(e)) => {
            let _ = handle.join();
            return Err(e).with_context(|| format!("failed to bind {host}:{port}"));
        }
        Err(_) => return Err(anyhow!("HTTP server did not start in time")),
    };
    for addr in &addrs {
        info!("HTTP 服务已启动: http://{}/video_feed", addr);
    }

    Ok(StreamServer {
        addrs,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// 单个 multipart 分段
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(BOUNDARY.as_bytes());
    payload.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n\r\n");
    payload
}

/// 每个客户端一个独立游标, 只在有新帧时发送
async fn video_feed(state: web::Data<ServerState>) -> HttpResponse {
    let mut frames = state.frames.subscribe();
    debug!("video_feed 客户端连接 (当前 {} 个)", state.frames.subscriber_count());

    let stream = stream! {
        while let Some(frame) = frames.next().await {
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(multipart_part(&frame.jpeg)));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        ))
        .streaming(stream)
}

async fn parking_status(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.status.read())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AnnotatedFrame, OccupancyStatus};
    use actix_web::body::MessageBody;
    use actix_web::test as actix_test;
    use std::future::poll_fn;

    fn state() -> ServerState {
        ServerState {
            status: Arc::new(StatusRegistry::new()),
            frames: FrameSlot::new(),
        }
    }

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(b"JPEG");
        assert_eq!(
            part,
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n\r\n".to_vec()
        );
    }

    #[actix_web::test]
    async fn test_parking_status_json() {
        let state = state();
        state.status.update(OccupancyStatus::new(2, 3));
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/parking_status").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body = actix_test::read_body(resp).await;
        assert_eq!(body, Bytes::from_static(br#"{"parked_cars":2,"available_spaces":3}"#));
    }

    #[actix_web::test]
    async fn test_video_feed_streams_latest_frame() {
        let state = state();
        state.frames.publish(AnnotatedFrame {
            seq: 9,
            jpeg: Arc::new(b"JPEG".to_vec()),
        });
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/video_feed").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );

        let body = resp.into_body();
        let mut body = std::pin::pin!(body);
        let Some(Ok(chunk)) = poll_fn(|cx| body.as_mut().poll_next(cx)).await else {
            panic!("stream ended without a frame");
        };
        assert_eq!(chunk, Bytes::from(multipart_part(b"JPEG")));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = spawn_server("127.0.0.1", 0, state()).unwrap();
        let port = first.addrs()[0].port();
        assert!(spawn_server("127.0.0.1", port, state()).is_err());
        first.stop();
    }
}
