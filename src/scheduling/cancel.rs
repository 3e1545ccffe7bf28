//! Cancellation signal tree.
//!
//! A [`CancelToken`] is a cheap, cloneable handle onto a shared abort flag.
//! Tokens can be linked parent → child: aborting a parent propagates to every
//! child still attached, but a child aborting never affects its parent or
//! siblings. `detach` removes the child's edge to its parent; it is
//! idempotent, matching the "cleanup called any number of times is a no-op
//! after the first" invariant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct Node {
    aborted: AtomicBool,
    children: Mutex<Vec<CancelToken>>,
}

/// A handle on one node of the cancellation tree.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Node>,
}

impl CancelToken {
    /// Create a fresh, unaborted, parentless token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Node {
                aborted: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// True if this token (or an ancestor) has been aborted.
    pub fn is_cancelled(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Abort this token and every child still attached to it.
    pub fn cancel(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = self.inner.children.lock();
        for child in children.iter() {
            child.cancel();
        }
    }

    /// Create a child token linked to this one.
    ///
    /// If `self` is already cancelled the child is returned already
    /// cancelled; the link is established synchronously, so a parent
    /// aborted before a child links never leaves that child unsignalled.
    pub fn child(&self) -> ChildToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.lock().push(child.clone());
        }
        ChildToken {
            token: child,
            parent: self.clone(),
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create `n` children of `self` plus a single handle that detaches all
    /// of them at once.
    pub fn children(parent: &CancelToken, n: usize) -> (Vec<CancelToken>, Cleanup) {
        let mut handles = Vec::with_capacity(n);
        let mut tokens = Vec::with_capacity(n);
        for _ in 0..n {
            let ct = parent.child();
            tokens.push(ct.token.clone());
            handles.push(ct);
        }
        let cleanup = Cleanup {
            handles: Arc::new(Mutex::new(handles)),
        };
        (tokens, cleanup)
    }

    /// Wait until this token is cancelled.
    pub async fn cancelled(&self) {
        // Polling with a short yield keeps this free of extra wakeup
        // plumbing; cancellation is not latency-critical relative to the
        // operations it interrupts (sleeps, slot waits).
        while !self.is_cancelled() {
            tokio::task::yield_now().await;
            if self.is_cancelled() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A child token paired with its detach-from-parent handle.
pub struct ChildToken {
    token: CancelToken,
    parent: CancelToken,
    detached: Arc<AtomicBool>,
}

impl ChildToken {
    /// The child's own cancellation token.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Detach this child from its parent. Idempotent.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut children = self.parent.inner.children.lock();
        children.retain(|c| !Arc::ptr_eq(&c.inner, &self.token.inner));
    }
}

/// Detaches a batch of children created via [`CancelToken::children`].
pub struct Cleanup {
    handles: Arc<Mutex<Vec<ChildToken>>>,
}

impl Cleanup {
    /// Detach every child from its parent. Idempotent.
    pub fn run(&self) {
        let handles = self.handles.lock();
        for h in handles.iter() {
            h.detach();
        }
    }
}

/// Convenience constructor for a child token plus a standalone detach
/// closure, for callers that don't want to hold onto a [`ChildToken`].
pub fn create_child(parent: Option<&CancelToken>) -> (CancelToken, Box<dyn Fn() + Send + Sync>) {
    match parent {
        Some(p) => {
            let child = p.child();
            let token = child.token();
            let child = Arc::new(child);
            let child_for_closure = child.clone();
            (token, Box::new(move || child_for_closure.detach()))
        }
        None => {
            let token = CancelToken::new();
            (token, Box::new(|| {}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_propagates_to_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.token().is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.token().cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_aborted_before_link_cancels_child_synchronously() {
        let parent = CancelToken::new();
        parent.cancel();
        let child = parent.child();
        assert!(child.token().is_cancelled());
    }

    #[test]
    fn detach_is_idempotent_and_stops_propagation() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.detach();
        child.detach(); // second call is a no-op
        parent.cancel();
        assert!(!child.token().is_cancelled());
    }

    #[test]
    fn children_batch_cleanup_detaches_all() {
        let parent = CancelToken::new();
        let (tokens, cleanup) = CancelToken::children(&parent, 3);
        cleanup.run();
        parent.cancel();
        for t in tokens {
            assert!(!t.is_cancelled());
        }
    }
}
