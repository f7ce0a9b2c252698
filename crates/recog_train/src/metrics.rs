//! Metrics - running averages and edit distance

/// Running mean of scalar values (loss tracking).
#[derive(Debug, Clone, Default)]
pub struct Averager {
    sum: f64,
    count: usize,
}

impl Averager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Adds a value that stands for `n` samples.
    pub fn add_weighted(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn val(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Edit distance normalized by the ground-truth length.
/// An empty ground truth scores 0 against an empty prediction and 1 otherwise.
pub fn norm_ed(pred: &str, gt: &str) -> f64 {
    let gt_len = gt.chars().count();
    if gt_len == 0 {
        return if pred.is_empty() { 0.0 } else { 1.0 };
    }
    edit_distance(pred, gt) as f64 / gt_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averager() {
        let mut avg = Averager::new();
        assert_eq!(avg.val(), 0.0);
        avg.add(1.0);
        avg.add(3.0);
        assert!((avg.val() - 2.0).abs() < 1e-12);
        avg.add_weighted(5.0, 2);
        assert!((avg.val() - 3.5).abs() < 1e-12);
        avg.reset();
        assert_eq!(avg.count(), 0);
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn test_norm_ed() {
        assert!((norm_ed("abd", "abc") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(norm_ed("x", ""), 1.0);
        assert_eq!(norm_ed("", ""), 0.0);
    }
}
