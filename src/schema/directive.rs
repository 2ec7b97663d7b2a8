use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveStatus {
    Pending,
    Incorporated,
}

/// An externally injected instruction to weave into a future chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub id: u64,
    pub text: String,
    pub target_chapter: u64,
    pub status: DirectiveStatus,
    /// Chapter the directive was woven into, once incorporated.
    #[serde(default)]
    pub incorporated_in: Option<u64>,
}

impl Directive {
    pub fn is_pending(&self) -> bool {
        self.status == DirectiveStatus::Pending
    }

    /// True when a chapter with this number may carry the directive.
    pub fn is_due(&self, chapter: u64) -> bool {
        self.is_pending() && self.target_chapter <= chapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_only_while_pending() {
        let mut d = Directive {
            id: 1,
            text: "A storm rolls in".to_string(),
            target_chapter: 4,
            status: DirectiveStatus::Pending,
            incorporated_in: None,
        };
        assert!(!d.is_due(3));
        assert!(d.is_due(4));
        assert!(d.is_due(9));
        d.status = DirectiveStatus::Incorporated;
        assert!(!d.is_due(9));
    }
}
