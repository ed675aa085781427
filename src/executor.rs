//! Executors: one OS thread driving an ordered group of node workers.
//!
//! Workers grouped in the same executor run serially on its thread, sorted
//! so that producers precede consumers; parallelism comes from duplicates
//! of the same executor shape. The thread owns the whole worker lifecycle:
//! `init` in insertion order, `first_run`, the `process` loop paced by the
//! group's looping interval, `last_run`, and `deinit` in reverse order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::node::{Node, Worker, WorkerCtx};
use crate::sleep::precise_sleep;

pub(crate) struct Member {
    pub name: String,
    pub node: Arc<Node>,
    pub worker: Box<dyn Worker>,
    pub ctx: WorkerCtx,
}

/// Call a function if this struct goes out of scope without calling
/// `defuse`, including during a panic stack-unwinding.
struct CatchPanic<F: FnOnce()> {
    /// True if the function should be called.
    primed: bool,
    /// Function to call.
    ///
    /// The `Drop` implementation will move out the function.
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    /// Avoid calling the function on drop.
    fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            (self.handler.take().unwrap())();
        }
    }
}

pub(crate) struct Executor {
    id: usize,
    batch_idx: usize,
    duplicate_num: usize,
    members: Vec<Member>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Executor {
    pub fn new(id: usize, batch_idx: usize, duplicate_num: usize) -> Executor {
        Executor {
            id,
            batch_idx,
            duplicate_num,
            members: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn batch_idx(&self) -> usize {
        self.batch_idx
    }

    #[allow(dead_code)]
    pub fn duplicate_num(&self) -> usize {
        self.duplicate_num
    }

    pub fn add_worker(&mut self, name: impl Into<String>, node: Arc<Node>, worker: Box<dyn Worker>) {
        let ctx = WorkerCtx::new(node.clone(), self.batch_idx);
        self.members.push(Member {
            name: name.into(),
            node,
            worker,
            ctx,
        });
    }

    /// The loop cadence of this executor: the minimum looping interval
    /// across its members.
    pub fn looping_interval(&self) -> Duration {
        self.members
            .iter()
            .map(|member| member.node.looping_interval())
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Reorder the members topologically along the pipeline's links so
    /// that producers precede consumers on this thread. Insertion order
    /// breaks ties; a cycle keeps the insertion order.
    pub fn generate_sorted(&mut self, links: &[(String, String)]) {
        let member_count = self.members.len();
        if member_count <= 1 {
            return;
        }
        let index: HashMap<&str, usize> = self
            .members
            .iter()
            .enumerate()
            .map(|(idx, member)| (member.name.as_str(), idx))
            .collect();
        let mut indegree = vec![0usize; member_count];
        let mut successors = vec![Vec::new(); member_count];
        for (from, to) in links {
            if let (Some(&f), Some(&t)) = (index.get(from.as_str()), index.get(to.as_str())) {
                if f != t {
                    successors[f].push(t);
                    indegree[t] += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(member_count);
        let mut placed = vec![false; member_count];
        while order.len() < member_count {
            let next = (0..member_count).find(|&i| !placed[i] && indegree[i] == 0);
            let Some(next) = next else {
                warn!(
                    "executor {} members form a cycle, keeping insertion order",
                    self.id
                );
                return;
            };
            placed[next] = true;
            order.push(next);
            for &successor in &successors[next] {
                indegree[successor] -= 1;
            }
        }

        let mut slots: Vec<Option<Member>> = self.members.drain(..).map(Some).collect();
        self.members = order
            .into_iter()
            .map(|idx| slots[idx].take().unwrap())
            .collect();
    }

    /// Spawn the executor thread. The members move onto it.
    pub fn start(&mut self) {
        let interval = self.looping_interval();
        let members = std::mem::take(&mut self.members);
        let stop = self.stop.clone();
        let id = self.id;
        self.handle = Some(
            std::thread::Builder::new()
                .name(format!("conflux-exec-{id}"))
                .spawn(move || run(id, members, interval, stop))
                .unwrap(),
        );
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Await the executor thread.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("executor {} thread panicked", self.id);
            }
        }
    }
}

fn run(id: usize, mut members: Vec<Member>, interval: Duration, stop: Arc<AtomicBool>) {
    debug!("executor {id} starting with {} workers", members.len());
    let mut catch_panic = CatchPanic::new(move || error!("executor {id} crashed!"));

    // a worker that fails to init sits the whole run out, except deinit
    let mut active: Vec<bool> = Vec::with_capacity(members.len());
    for member in &mut members {
        match member.worker.init(&member.ctx) {
            Ok(()) => active.push(true),
            Err(e) => {
                error!("worker of `{}` failed to init: {e}", member.name);
                active.push(false);
            }
        }
    }

    for (member, &ok) in members.iter_mut().zip(&active) {
        if ok {
            member.worker.first_run(&member.ctx);
        }
    }

    let mut panics: u64 = 0;
    while !stop.load(Ordering::Acquire) {
        let mut live = 0usize;
        for (member, &ok) in members.iter_mut().zip(&active) {
            if !ok || member.ctx.is_stopped() {
                continue;
            }
            live += 1;
            let call = catch_unwind(AssertUnwindSafe(|| member.worker.process(&member.ctx)));
            if call.is_err() {
                panics += 1;
                error!(
                    "worker of `{}` panicked in process ({panics} so far)",
                    member.name
                );
            }
        }
        if live == 0 {
            break;
        }
        if !interval.is_zero() {
            precise_sleep(interval);
        }
    }

    for (member, &ok) in members.iter_mut().zip(&active) {
        if ok {
            member.worker.last_run(&member.ctx);
        }
    }
    for member in members.iter_mut().rev() {
        member.worker.deinit(&member.ctx);
    }

    catch_panic.defuse();
    debug!("executor {id} exited ({panics} process panics)");
}
