// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测结果 (Detection results)
///
/// 模型输出的统一表示, 只在单个推理周期内存在
/// - Bbox:      中心点+宽高编码的检测框
/// - Detection: 类别 + 标签 + 置信度 + 检测框
pub mod types;

pub use types::{non_max_suppression, Bbox, Corners, Detection};
