//! The two concurrency models, behind one [`Dispatch`] interface chosen at
//! startup.
//!
//! * [`InlineIo`]: the event loop does `read_once` and `write` itself;
//!   workers only run `process` (parse, resolve, build the response).
//! * [`DeferredIo`]: the event loop only queues a role-tagged work item;
//!   workers perform the socket I/O as well.
//!
//! Either way a worker that finds the connection dead posts a close request
//! through [`Context::request_close`] instead of closing it, since teardown
//! and the timer list belong to the event loop.

use crate::config::DispatchModel;
use crate::conn::Processed;
use crate::context::Context;
use crate::error::LumenResult;
use crate::pool::ThreadPool;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Buffered bytes are waiting to be parsed.
    Parse,
    /// Read from the socket, then parse.
    Read,
    /// Flush the pending response.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub slot: usize,
    pub generation: u64,
    pub role: Role,
}

/// What the event loop should do with the connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Activity seen; extend the idle deadline.
    Keep,
    Close,
}

pub trait Dispatch: Send {
    fn readable(&self, ctx: &Context, slot: usize, generation: u64) -> Verdict;

    fn writable(&self, ctx: &Context, slot: usize, generation: u64) -> Verdict;

    /// Stop the workers. Running items finish; queued ones are dropped.
    fn shutdown(&mut self);
}

pub fn build(
    model: DispatchModel,
    ctx: Arc<Context>,
    threads: usize,
    capacity: usize,
) -> LumenResult<Box<dyn Dispatch>> {
    let pool = ThreadPool::new(threads, capacity, move |item: WorkItem| run_item(&ctx, item))?;
    Ok(match model {
        DispatchModel::Inline => Box::new(InlineIo { pool }),
        DispatchModel::Deferred => Box::new(DeferredIo { pool }),
    })
}

/// Worker side of both models.
fn run_item(ctx: &Context, item: WorkItem) {
    let Some(slot) = ctx.slot(item.slot) else {
        return;
    };
    let alive = if slot.generation() != item.generation {
        true
    } else {
        let mut conn = slot.conn.lock();
        match item.role {
            Role::Parse => conn.process(ctx) != Processed::Failed,
            Role::Read => conn.read_once() && conn.process(ctx) != Processed::Failed,
            Role::Write => conn.write(ctx),
        }
    };
    // Release the slot before asking for teardown, so the event loop never
    // sees a close request for a slot that still looks busy.
    slot.end_work();
    if !alive {
        ctx.request_close(item.slot, item.generation);
    }
}

fn enqueue(pool: &ThreadPool<WorkItem>, ctx: &Context, item: WorkItem) -> Verdict {
    let Some(slot) = ctx.slot(item.slot) else {
        return Verdict::Close;
    };
    slot.begin_work();
    match pool.append(item) {
        Ok(()) => Verdict::Keep,
        Err(item) => {
            slot.end_work();
            warn!(slot = item.slot, role = ?item.role, queued = pool.queued(), "work queue full, dropping connection");
            Verdict::Close
        }
    }
}

pub struct InlineIo {
    pool: ThreadPool<WorkItem>,
}

impl Dispatch for InlineIo {
    fn readable(&self, ctx: &Context, slot: usize, generation: u64) -> Verdict {
        let Some(s) = ctx.slot(slot) else {
            return Verdict::Close;
        };
        if !s.conn.lock().read_once() {
            return Verdict::Close;
        }
        enqueue(
            &self.pool,
            ctx,
            WorkItem {
                slot,
                generation,
                role: Role::Parse,
            },
        )
    }

    fn writable(&self, ctx: &Context, slot: usize, _generation: u64) -> Verdict {
        match ctx.slot(slot) {
            Some(s) if s.conn.lock().write(ctx) => Verdict::Keep,
            _ => Verdict::Close,
        }
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

pub struct DeferredIo {
    pool: ThreadPool<WorkItem>,
}

impl Dispatch for DeferredIo {
    fn readable(&self, ctx: &Context, slot: usize, generation: u64) -> Verdict {
        enqueue(
            &self.pool,
            ctx,
            WorkItem {
                slot,
                generation,
                role: Role::Read,
            },
        )
    }

    fn writable(&self, ctx: &Context, slot: usize, generation: u64) -> Verdict {
        enqueue(
            &self.pool,
            ctx,
            WorkItem {
                slot,
                generation,
                role: Role::Write,
            },
        )
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}
