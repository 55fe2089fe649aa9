/// Snapshot of how full the context window is. Recomputed on demand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub total_tokens: u32,
    pub max_tokens: u32,
    /// Always within `0.0..=100.0`.
    pub percentage: f32,
    pub remaining: u32,
}

impl ContextUsage {
    #[must_use]
    pub fn new(total_tokens: u32, max_tokens: u32) -> Self {
        let percentage = if max_tokens == 0 {
            if total_tokens == 0 { 0.0 } else { 100.0 }
        } else {
            (total_tokens as f32 / max_tokens as f32 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            total_tokens,
            max_tokens,
            percentage,
            remaining: max_tokens.saturating_sub(total_tokens),
        }
    }

    /// Format for status lines: "2.1k / 180.0k (1%)"
    #[must_use]
    pub fn format_compact(&self) -> String {
        fn format_k(n: u32) -> String {
            if n >= 1_000_000 {
                format!("{:.1}M", n as f32 / 1_000_000.0)
            } else if n >= 1000 {
                format!("{:.1}k", n as f32 / 1000.0)
            } else {
                n.to_string()
            }
        }

        format!(
            "{} / {} ({:.0}%)",
            format_k(self.total_tokens),
            format_k(self.max_tokens),
            self.percentage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ContextUsage;

    #[test]
    fn percentage_and_remaining() {
        let usage = ContextUsage::new(45_000, 180_000);
        assert!((usage.percentage - 25.0).abs() < f32::EPSILON);
        assert_eq!(usage.remaining, 135_000);
    }

    #[test]
    fn over_budget_is_clamped() {
        let usage = ContextUsage::new(200_000, 180_000);
        assert!((usage.percentage - 100.0).abs() < f32::EPSILON);
        assert_eq!(usage.remaining, 0);
    }

    #[test]
    fn zero_ceiling() {
        assert_eq!(ContextUsage::new(0, 0).percentage, 0.0);
        assert_eq!(ContextUsage::new(5, 0).percentage, 100.0);
        assert_eq!(ContextUsage::new(5, 0).remaining, 0);
    }

    #[test]
    fn format_compact() {
        let formatted = ContextUsage::new(2100, 180_000).format_compact();
        assert!(formatted.contains("2.1k"));
        assert!(formatted.contains("180.0k"));
        assert!(formatted.contains("1%"));
    }
}
