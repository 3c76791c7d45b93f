// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测框 (center + size, 处理分辨率下的像素坐标)
///
/// YOLO 系列模型原生输出 `cx, cy, w, h`, 绘制前通过 [`Bbox::corners`] 转为角点
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bbox {
    cx: f32,
    cy: f32,
    width: f32,
    height: f32,
}

impl Bbox {
    pub fn from_cxcywh(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            cx,
            cy,
            width,
            height,
        }
    }

    pub fn from_xyxy(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        let width = xmax - xmin;
        let height = ymax - ymin;
        Self {
            cx: xmin + width / 2.,
            cy: ymin + height / 2.,
            width,
            height,
        }
    }

    pub fn cx(&self) -> f32 {
        self.cx
    }

    pub fn cy(&self) -> f32 {
        self.cy
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.cx - self.width / 2.
    }

    pub fn ymin(&self) -> f32 {
        self.cy - self.height / 2.
    }

    pub fn xmax(&self) -> f32 {
        self.cx + self.width / 2.
    }

    pub fn ymax(&self) -> f32 {
        self.cy + self.height / 2.
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// 转为整数角点 (截断, 与绘制坐标一致)
    pub fn corners(&self) -> Corners {
        Corners {
            x_min: self.xmin() as i32,
            y_min: self.ymin() as i32,
            x_max: self.xmax() as i32,
            y_max: self.ymax() as i32,
        }
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin().max(another.xmin());
        let r = self.xmax().min(another.xmax());
        let t = self.ymin().max(another.ymin());
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

/// 角点坐标 (x_min, y_min, x_max, y_max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corners {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl Corners {
    /// 减去标定偏移: 模型训练画面与摄像头实时画面之间的固定位移
    pub fn shifted(self, shift_x: i32, shift_y: i32) -> Self {
        Self {
            x_min: self.x_min - shift_x,
            y_min: self.y_min - shift_y,
            x_max: self.x_max - shift_x,
            y_max: self.y_max - shift_y,
        }
    }

    pub fn width(&self) -> i32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> i32 {
        self.y_max - self.y_min
    }
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: Bbox,
}

impl Detection {
    pub fn new(class_id: usize, label: impl Into<String>, confidence: f32, bbox: Bbox) -> Self {
        Self {
            class_id,
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// 标签是否匹配 (忽略大小写)
    pub fn is(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

/// 非极大值抑制: 按置信度降序, 丢弃与已保留框 IoU 超过阈值的框
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_to_corners() {
        let bbox = Bbox::from_cxcywh(50.0, 40.0, 20.0, 10.0);
        assert_eq!(
            bbox.corners(),
            Corners {
                x_min: 40,
                y_min: 35,
                x_max: 60,
                y_max: 45
            }
        );
    }

    #[test]
    fn test_shift_applies_to_all_corners() {
        let c = Bbox::from_xyxy(150.0, 120.0, 200.0, 180.0)
            .corners()
            .shifted(100, 100);
        assert_eq!((c.x_min, c.y_min, c.x_max, c.y_max), (50, 20, 100, 80));
        assert_eq!((c.width(), c.height()), (50, 60));
    }

    #[test]
    fn test_label_match_ignores_case() {
        let d = Detection::new(1, "Occupied", 0.9, Bbox::default());
        assert!(d.is("occupied"));
        assert!(d.is("OCCUPIED"));
        assert!(!d.is("empty"));
    }

    #[test]
    fn test_iou() {
        let a = Bbox::from_xyxy(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::from_xyxy(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&Bbox::from_xyxy(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let mut xs = vec![
            Detection::new(0, "car", 0.6, Bbox::from_xyxy(0.0, 0.0, 10.0, 10.0)),
            Detection::new(0, "car", 0.9, Bbox::from_xyxy(1.0, 1.0, 11.0, 11.0)),
            Detection::new(0, "car", 0.7, Bbox::from_xyxy(50.0, 50.0, 60.0, 60.0)),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].confidence, 0.9);
        assert_eq!(xs[1].confidence, 0.7);
    }
}
