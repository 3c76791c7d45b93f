// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 停车位实时监控 - 采集 → 双模型推理 → 标注 → MJPEG 推流 + 车位状态接口
//!
//! 主程序入口 - 直接运行: cargo run --bin parkwatch --release -- --source http://cam/video

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info, warn};

use parkwatch::input::open_source;
use parkwatch::models::YoloConfig;
use parkwatch::pipeline::Annotator;
use parkwatch::server::{spawn_server, ServerState};
use parkwatch::{telemetry, Args, Pipeline, PipelineConfig, Shutdown, YoloModel};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn load_model(
    config: &PipelineConfig,
    path: &std::path::Path,
    names: Option<Vec<String>>,
) -> Result<YoloModel> {
    let model = YoloModel::new(YoloConfig {
        model: path.to_path_buf(),
        conf: config.conf_threshold,
        iou: config.iou_threshold,
        cuda: config.cuda,
        intra_threads: config.intra_threads,
        names,
        ..Default::default()
    })
    .with_context(|| format!("failed to load model {}", path.display()))?;
    info!("✅ 模型加载成功: {}", path.display());
    Ok(model)
}

fn main() -> Result<()> {
    telemetry::init();

    let config = Args::parse().into_config()?;
    config.log_summary();

    // 采集源打不开直接退出
    let source = open_source(&config).context("video source unavailable")?;

    let occupancy = load_model(&config, &config.occupancy_model, config.occupancy_labels.clone())?;
    let objects = load_model(&config, &config.object_model, config.object_labels.clone())?;
    let annotator = Annotator::new(config.font.as_deref())?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("收到退出信号");
            shutdown.trigger();
        }) {
            warn!("Ctrl+C 处理器安装失败: {e}");
        }
    }

    let pipeline = Pipeline::spawn(
        &config,
        source,
        Box::new(occupancy),
        Box::new(objects),
        annotator,
        shutdown.clone(),
    )?;

    let server = match spawn_server(
        &config.host,
        config.port,
        ServerState {
            status: pipeline.status(),
            frames: pipeline.output(),
        },
    ) {
        Ok(server) => server,
        Err(e) => {
            shutdown.trigger();
            let _ = pipeline.join();
            return Err(e);
        }
    };

    let result = pipeline.join();
    server.stop();

    if let Err(e) = &result {
        error!("❌ {:#}", e);
    }
    info!("已退出");
    result
}
