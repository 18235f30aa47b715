//! A free-list pool of [`super::Context`] allocations, so a long-running server does
//! not pay an allocation (and a clutch of `HashMap`/`Vec` allocations inside it) for
//! every incoming request.

use std::sync::Mutex;

use super::Context;

const DEFAULT_POOL_CAPACITY: usize = 256;

/// Hands out reset [`Context`] values and reclaims them via [`PooledContext`]'s
/// `Drop` impl. Bounded: once the free list is at capacity, surplus contexts are
/// simply dropped instead of returned, so the pool can never grow unbounded under a
/// request burst.
pub struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        ContextPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Takes a reset [`Context`] off the free list, or allocates a fresh one if the
    /// list is empty.
    pub fn acquire(self: &std::sync::Arc<Self>) -> PooledContext {
        let ctx = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Box::new(Context::new()));
        PooledContext {
            ctx: Some(ctx),
            pool: self.clone(),
        }
    }

    fn release(&self, mut ctx: Box<Context>) {
        ctx.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        ContextPool::new(DEFAULT_POOL_CAPACITY)
    }
}

/// A [`Context`] on loan from a [`ContextPool`]. Derefs to `Context`; returns the
/// allocation to the pool (reset) when dropped.
pub struct PooledContext {
    ctx: Option<Box<Context>>,
    pool: std::sync::Arc<ContextPool>,
}

impl std::ops::Deref for PooledContext {
    type Target = Context;
    fn deref(&self) -> &Context {
        self.ctx.as_ref().expect("context taken before drop")
    }
}

impl std::ops::DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_mut().expect("context taken before drop")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_then_drop_returns_to_pool() {
        let pool = Arc::new(ContextPool::new(4));
        assert_eq!(pool.len(), 0);
        {
            let mut ctx = pool.acquire();
            ctx.request.path = "/probe".to_string();
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn reused_context_is_reset() {
        let pool = Arc::new(ContextPool::new(4));
        {
            let mut ctx = pool.acquire();
            ctx.request.path = "/first".to_string();
            ctx.response.status_code = 404;
        }
        let ctx = pool.acquire();
        assert_eq!(ctx.request.path, "");
        assert_eq!(ctx.response.status_code, 200);
    }

    #[test]
    fn surplus_contexts_are_dropped_not_pooled() {
        let pool = Arc::new(ContextPool::new(1));
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.len(), 1);
    }
}
