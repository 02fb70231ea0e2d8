//! Background worker pool.
//!
//! Handlers registered as `Background` run on this pool instead of the
//! endpoint thread. Workers never touch endpoint state: every mutation they
//! request (responses, nested requests, releases) is posted back through a
//! completion channel and executed by the owning endpoint on its next tick.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::buffer::{MsgAllocator, MsgBuffer};
use crate::error::Result;
use crate::nexus::ReqHandlerFn;
use crate::rpc::{Continuation, ReqHandle, RespHandle, RpcContext};
use crate::session::SessionHandle;

thread_local! {
    static IN_BACKGROUND: Cell<bool> = const { Cell::new(false) };
}

/// True on background worker threads.
pub fn in_background() -> bool {
    IN_BACKGROUND.with(|f| f.get())
}

/// One dispatched background request.
pub(crate) struct BgWork {
    pub handler: ReqHandlerFn,
    pub req: ReqHandle,
}

/// An endpoint mutation deferred from a worker thread.
pub(crate) enum BgCompletion {
    Response(ReqHandle),
    Request {
        session: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    },
    Release(RespHandle),
}

/// The context handed to handlers running on worker threads.
pub(crate) struct BgContext {
    comp_tx: Sender<BgCompletion>,
    allocator: Arc<MsgAllocator>,
}

impl RpcContext for BgContext {
    fn alloc_msg_buffer(&self, max_size: usize) -> Result<MsgBuffer> {
        self.allocator.alloc(max_size)
    }

    fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.allocator.free(buf);
    }

    fn enqueue_request(
        &self,
        session: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()> {
        // Deferred to the endpoint thread; failures there are logged, not
        // returned.
        let _ = self.comp_tx.send(BgCompletion::Request {
            session,
            req_type,
            req_msgbuf,
            cont,
            tag,
        });
        Ok(())
    }

    fn enqueue_response(&self, req: ReqHandle) {
        let _ = self.comp_tx.send(BgCompletion::Response(req));
    }

    fn release_response(&self, resp: RespHandle) {
        let _ = self.comp_tx.send(BgCompletion::Release(resp));
    }

    fn in_background(&self) -> bool {
        true
    }
}

/// Worker pool for one endpoint.
pub(crate) struct BgPool {
    work_tx: Option<Sender<BgWork>>,
    workers: Vec<JoinHandle<()>>,
}

impl BgPool {
    pub fn new(
        num_threads: usize,
        allocator: Arc<MsgAllocator>,
        comp_tx: Sender<BgCompletion>,
    ) -> Self {
        let (work_tx, work_rx) = unbounded::<BgWork>();
        let workers = (0..num_threads)
            .map(|i| {
                let work_rx: Receiver<BgWork> = work_rx.clone();
                let ctx = BgContext {
                    comp_tx: comp_tx.clone(),
                    allocator: allocator.clone(),
                };
                std::thread::Builder::new()
                    .name(format!("pacerpc-bg-{i}"))
                    .spawn(move || {
                        IN_BACKGROUND.with(|f| f.set(true));
                        for work in work_rx.iter() {
                            (work.handler)(&ctx, work.req);
                        }
                    })
                    .expect("spawn background worker")
            })
            .collect();

        Self {
            work_tx: Some(work_tx),
            workers,
        }
    }

    pub fn submit(&self, work: BgWork) {
        self.work_tx
            .as_ref()
            .expect("background pool already shut down")
            .send(work)
            .expect("background workers gone");
    }
}

impl Drop for BgPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.work_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_background_flag() {
        assert!(!in_background());
        let handle = std::thread::spawn(|| {
            IN_BACKGROUND.with(|f| f.set(true));
            in_background()
        });
        assert!(handle.join().unwrap());
        assert!(!in_background());
    }
}
