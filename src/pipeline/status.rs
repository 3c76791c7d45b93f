// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// 车位统计 (最近一次成功推理的结果)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyStatus {
    pub parked_cars: u32,
    pub available_spaces: u32,
}

impl OccupancyStatus {
    pub fn new(parked_cars: u32, available_spaces: u32) -> Self {
        Self {
            parked_cars,
            available_spaces,
        }
    }

    pub fn total(&self) -> u32 {
        self.parked_cars + self.available_spaces
    }
}

/// 车位状态注册表: 推理线程写, HTTP 处理器读
///
/// 两个字段整体替换, 读者永远看不到半更新的状态
#[derive(Debug, Default)]
pub struct StatusRegistry {
    inner: RwLock<OccupancyStatus>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: OccupancyStatus) {
        // 锁中毒时值本身仍然完整 (Copy 整体写入)
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = status;
    }

    pub fn read(&self) -> OccupancyStatus {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_default_is_zero() {
        let registry = StatusRegistry::new();
        assert_eq!(registry.read(), OccupancyStatus::new(0, 0));
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = StatusRegistry::new();
        registry.update(OccupancyStatus::new(1, 4));
        registry.update(OccupancyStatus::new(2, 3));
        assert_eq!(registry.read(), OccupancyStatus::new(2, 3));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&OccupancyStatus::new(2, 3)).unwrap();
        assert_eq!(json, r#"{"parked_cars":2,"available_spaces":3}"#);
    }

    #[test]
    fn test_no_torn_reads() {
        // 写入方始终保持 parked + available == 10
        let registry = Arc::new(StatusRegistry::new());
        registry.update(OccupancyStatus::new(0, 10));

        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    let parked = i % 11;
                    registry.update(OccupancyStatus::new(parked, 10 - parked));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        assert_eq!(registry.read().total(), 10);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
