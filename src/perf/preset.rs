use crate::config::TestConfig;

/// Preset disk tests in the usual benchmark notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    /// Sequential 1MiB blocks with a queue depth of 8.
    Seq1Mq8t1,
    /// Sequential 1MiB blocks with a single outstanding request.
    Seq1Mq1t1,
    /// Random 4KiB blocks with queue depth 32.
    Rnd4kQ32t1,
    /// Random 4KiB blocks with a single outstanding request.
    Rnd4kQ1t1,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::Seq1Mq8t1, Preset::Seq1Mq1t1, Preset::Rnd4kQ32t1, Preset::Rnd4kQ1t1];

    fn params(self) -> (usize, usize, bool, &'static str) {
        match self {
            Preset::Seq1Mq8t1 => (1024 * 1024, 8, false, "SEQ1M Q8T1"),
            Preset::Seq1Mq1t1 => (1024 * 1024, 1, false, "SEQ1M Q1T1"),
            Preset::Rnd4kQ32t1 => (4 * 1024, 32, true, "RND4K Q32T1"),
            Preset::Rnd4kQ1t1 => (4 * 1024, 1, true, "RND4K Q1T1"),
        }
    }

    pub fn label(self) -> &'static str {
        self.params().3
    }

    pub fn is_random(self) -> bool {
        self.params().2
    }

    /// Accepts `SEQ1M Q8T1`, `seq1m-q8t1`, `rnd4kq32t1`...
    pub fn from_label(s: &str) -> Option<Self> {
        let key: String = s.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_uppercase()).collect();
        Self::ALL.into_iter().find(|p| p.label().replace(' ', "") == key)
    }

    /// `base` with this preset's block size and queue depth.
    pub fn config(self, base: &TestConfig) -> TestConfig {
        let (block_size, queue_depth, _, _) = self.params();
        TestConfig { block_size, queue_depth, ..base.clone() }
    }
}
