//! 叙述日志（快照中的 context_log）
//!
//! 保留最近 N 条带时间戳的叙述，超出时丢弃最旧的；供诊断与重启后恢复上下文。

/// 有界叙述日志
#[derive(Clone, Debug)]
pub struct NarrationLog {
    entries: Vec<String>,
    max_entries: usize,
}

impl NarrationLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// 从快照恢复
    pub fn from_entries(entries: Vec<String>, max_entries: usize) -> Self {
        let mut log = Self::new(max_entries);
        log.entries = entries;
        log.prune();
        log
    }

    pub fn push(&mut self, entry: impl AsRef<str>) {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        self.entries.push(format!("[{}] {}", stamp, entry.as_ref()));
        self.prune();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// 最近 n 条
    pub fn recent(&self, n: usize) -> Vec<String> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].to_vec()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prune(&mut self) {
        if self.entries.len() > self.max_entries {
            let drop = self.entries.len() - self.max_entries;
            self.entries.drain(..drop);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prunes_oldest() {
        let mut log = NarrationLog::new(2);
        log.push("a");
        log.push("b");
        log.push("c");
        assert_eq!(log.len(), 2);
        assert!(log.entries()[0].ends_with("b"));
        assert!(log.recent(1)[0].ends_with("c"));
    }

    #[test]
    fn test_from_entries_respects_limit() {
        let log = NarrationLog::from_entries(vec!["1".into(), "2".into(), "3".into()], 2);
        assert_eq!(log.entries(), &["2".to_string(), "3".to_string()]);
    }
}
