use crate::state::HistoryPoint;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HistoryRing {
    points: VecDeque<HistoryPoint>,
    max_age_ms: i64,
    max_points: usize,
}

impl HistoryRing {
    pub fn new(max_age: Duration, max_points: usize) -> Self {
        Self {
            points: VecDeque::new(),
            max_age_ms: i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX),
            max_points: max_points.max(1),
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        let cutoff = point.time.saturating_sub(self.max_age_ms);
        self.points.push_back(point);

        while self.points.front().is_some_and(|p| p.time < cutoff) {
            self.points.pop_front();
        }
        while self.points.len() > self.max_points {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point(time: i64) -> HistoryPoint {
        HistoryPoint {
            time,
            cpu: 1.0,
            mem: 2.0,
            disks: BTreeMap::new(),
        }
    }

    #[test]
    fn trims_points_older_than_max_age() {
        let mut ring = HistoryRing::new(Duration::from_secs(10), 100);
        for t in [0, 5_000, 9_000, 12_000, 20_000] {
            ring.push(point(t));
        }
        let times: Vec<i64> = ring.to_vec().iter().map(|p| p.time).collect();
        assert_eq!(times, vec![12_000, 20_000]);
    }

    #[test]
    fn point_exactly_at_cutoff_is_kept() {
        let mut ring = HistoryRing::new(Duration::from_secs(10), 100);
        ring.push(point(0));
        ring.push(point(10_000));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn trims_to_max_points() {
        let mut ring = HistoryRing::new(Duration::from_secs(3_600), 3);
        for t in 0..10 {
            ring.push(point(t * 1_000));
        }
        let times: Vec<i64> = ring.to_vec().iter().map(|p| p.time).collect();
        assert_eq!(times, vec![7_000, 8_000, 9_000]);
    }

    #[test]
    fn bounds_hold_after_every_append() {
        let max_age = Duration::from_secs(30);
        let mut ring = HistoryRing::new(max_age, 50);
        for i in 0..500_i64 {
            let latest = i * 700;
            ring.push(point(latest));
            assert!(ring.len() <= 50);
            assert!(ring
                .to_vec()
                .iter()
                .all(|p| p.time >= latest - max_age.as_millis() as i64));
        }
    }

    #[test]
    fn copies_are_independent() {
        let mut ring = HistoryRing::new(Duration::from_secs(60), 10);
        let mut p = point(1);
        p.disks.insert("/".to_string(), 50.0);
        ring.push(p);

        let mut copy = ring.to_vec();
        copy[0].disks.insert("/mnt/usb".to_string(), 1.0);
        copy[0].cpu = 99.0;

        let fresh = ring.to_vec();
        assert_eq!(fresh[0].disks.len(), 1);
        assert_eq!(fresh[0].cpu, 1.0);
    }
}
