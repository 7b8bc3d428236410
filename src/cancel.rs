use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared between a caller and running work.
///
/// A child token observes its parent's cancellation but can also be cancelled
/// on its own without affecting the parent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    own: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::Relaxed)
            || self
                .ancestors
                .iter()
                .any(|flag| flag.load(Ordering::Relaxed))
    }

    /// Token cancelled by either itself or `self`.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.own));
        Self {
            own: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_but_not_the_reverse() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(grandchild.is_cancelled());

        let other = parent.child();
        assert!(!other.is_cancelled());
        parent.cancel();
        assert!(other.is_cancelled());
    }
}
