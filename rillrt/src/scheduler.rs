use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::value::{ObjRef, Value};

/// Per-thread value-stack and call-frame bounds.
pub const STACK_MAX: usize = 512;
pub const FRAMES_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Finished,
}

#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Always an `Obj::Closure`.
    pub closure: ObjRef,
    pub func_index: u16,
    pub ip: usize,
    /// Stack index of this frame's slot 0 (the callee/receiver slot).
    pub base: usize,
}

#[derive(Debug)]
pub struct GreenThread {
    pub id: usize,
    pub state: ThreadState,
    pub wake_time: Option<Instant>,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<crate::object::UpvalueRef>,
    pub children: Vec<usize>,
    /// The value a blocked sender is waiting to deliver.
    pub pending_value: Value,
    pub active_select: Option<SelectFrame>,
}

impl GreenThread {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: ThreadState::Ready,
            wake_time: None,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            children: Vec::new(),
            pending_value: Value::Null,
            active_select: None,
        }
    }
}

pub type PipeRef = Rc<RefCell<Pipe>>;

/// A bounded FIFO channel. Invariants: a non-empty buffer implies no blocked
/// readers; spare capacity implies no blocked writers; closed implies no
/// blocked writers.
#[derive(Debug)]
pub struct Pipe {
    pub id: usize,
    pub capacity: usize,
    pub buffer: VecDeque<Value>,
    pub readers: VecDeque<usize>,
    pub writers: VecDeque<usize>,
    pub closed: bool,
    pub select_waiters: Vec<usize>,
}

impl Pipe {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            buffer: VecDeque::new(),
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            closed: false,
            select_waiters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectKind {
    Recv,
    Send,
}

#[derive(Debug, Clone)]
pub struct SelectCase {
    pub kind: SelectKind,
    /// `None` marks a disabled case (the pipe expression was null).
    pub pipe: Option<PipeRef>,
    /// Frame-relative receive slot; 0xFF discards the value.
    pub slot: u8,
    pub value: Value,
    pub target_ip: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SelectFrame {
    pub cases: Vec<SelectCase>,
    pub has_default: bool,
    pub default_target_ip: usize,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Handed to a reader or buffered.
    Delivered,
    /// Sender parked; its value sits in `pending_value`.
    Blocked,
}

#[derive(Debug)]
pub enum RecvOutcome {
    Value(Value),
    /// Receiver parked; a null placeholder should be pushed for the waker
    /// to overwrite.
    Blocked,
}

#[derive(Debug)]
pub enum JoinOutcome {
    Done(Value),
    Blocked,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    next_thread_id: usize,
    pub threads: HashMap<usize, GreenThread>,
    pub ready_queue: VecDeque<usize>,
    blocked_queue: BinaryHeap<Reverse<(Instant, usize)>>,
    /// parent id → child id being joined.
    join_map: HashMap<usize, usize>,
    return_values: HashMap<usize, Value>,
    next_pipe_id: usize,
    pipes: HashMap<usize, PipeRef>,
    pub trace: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- threads -------------------------------------------------------

    pub fn alloc_thread_id(&mut self) -> usize {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        id
    }

    pub fn add_thread(&mut self, thread: GreenThread) {
        self.threads.insert(thread.id, thread);
    }

    pub fn enqueue(&mut self, id: usize) {
        self.ready_queue.push_back(id);
    }

    pub fn dequeue(&mut self) -> Option<usize> {
        while let Some(id) = self.ready_queue.pop_front() {
            if self.threads.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    pub fn is_live(&self, id: usize) -> bool {
        self.threads
            .get(&id)
            .map(|t| t.state != ThreadState::Finished)
            .unwrap_or(false)
    }

    pub fn state_of(&self, id: usize) -> Option<ThreadState> {
        self.threads.get(&id).map(|t| t.state)
    }

    pub fn set_return_value(&mut self, id: usize, value: Value) {
        self.return_values.insert(id, value);
    }

    pub fn return_value(&mut self, id: usize) -> Value {
        self.return_values.get(&id).cloned().unwrap_or(Value::Null)
    }

    /// Wakes every parent joined on `finished`, depositing the return value
    /// at the top of the parent's stack and scheduling it ahead of the
    /// ready queue.
    pub fn notify_join_waiters(&mut self, finished: usize) {
        let value = self.return_value(finished);
        let parents: Vec<usize> = self
            .join_map
            .iter()
            .filter(|(_, child)| **child == finished)
            .map(|(parent, _)| *parent)
            .collect();
        for parent in parents {
            self.join_map.remove(&parent);
            if let Some(thread) = self.threads.get_mut(&parent) {
                if thread.state == ThreadState::Finished {
                    continue;
                }
                if let Some(top) = thread.stack.last_mut() {
                    *top = value.clone();
                } else {
                    thread.stack.push(value.clone());
                }
                thread.state = ThreadState::Ready;
                self.ready_queue.push_front(parent);
            }
        }
    }

    /// Removes a thread and, recursively, every descendant. Cancelled
    /// descendants simply vanish; stale ids in wait queues are skipped when
    /// encountered.
    pub fn kill_thread_and_children(&mut self, id: usize) {
        if let Some(thread) = self.threads.remove(&id) {
            if self.trace {
                eprintln!("[thread {} killed]", id);
            }
            for child in thread.children {
                self.kill_thread_and_children(child);
            }
        }
    }

    pub fn join(&mut self, current: usize, target: usize) -> JoinOutcome {
        if !self.is_live(target) {
            return JoinOutcome::Done(self.return_value(target));
        }
        self.join_map.insert(current, target);
        if let Some(thread) = self.threads.get_mut(&current) {
            thread.state = ThreadState::Blocked;
            thread.wake_time = None;
        }
        JoinOutcome::Blocked
    }

    // ---- sleeping ------------------------------------------------------

    /// `sleep(0)` still yields the time slice; positive delays park the
    /// thread until its deadline.
    pub fn send_to_sleep(&mut self, id: usize, ms: i64) {
        if let Some(thread) = self.threads.get_mut(&id) {
            if ms <= 0 {
                thread.state = ThreadState::Ready;
            } else {
                thread.state = ThreadState::Blocked;
                thread.wake_time = Some(Instant::now() + Duration::from_millis(ms as u64));
            }
        }
    }

    pub fn block_sleeping(&mut self, id: usize) {
        if let Some(wake) = self.threads.get(&id).and_then(|t| t.wake_time) {
            self.blocked_queue.push(Reverse((wake, id)));
        }
    }

    pub fn wake_threads(&mut self, now: Instant) {
        while let Some(Reverse((wake, id))) = self.blocked_queue.peek().copied() {
            if wake > now {
                break;
            }
            self.blocked_queue.pop();
            if let Some(thread) = self.threads.get_mut(&id) {
                if thread.state == ThreadState::Blocked {
                    thread.state = ThreadState::Ready;
                    thread.wake_time = None;
                    self.ready_queue.push_back(id);
                }
            }
        }
    }

    pub fn next_wake_time(&self) -> Option<Instant> {
        self.blocked_queue.peek().map(|Reverse((wake, _))| *wake)
    }

    // ---- pipes ---------------------------------------------------------

    pub fn create_pipe(&mut self, capacity: usize) -> (usize, PipeRef) {
        let id = self.next_pipe_id;
        self.next_pipe_id += 1;
        let pipe = Rc::new(RefCell::new(Pipe::new(id, capacity)));
        self.pipes.insert(id, Rc::clone(&pipe));
        (id, pipe)
    }

    pub fn can_receive(&self, pipe: &Pipe) -> bool {
        !pipe.buffer.is_empty()
            || pipe.writers.iter().any(|id| self.is_live(*id))
            || pipe.closed
    }

    pub fn can_send(&self, pipe: &Pipe) -> bool {
        !pipe.closed
            && (pipe.readers.iter().any(|id| self.is_live(*id))
                || pipe.buffer.len() < pipe.capacity)
    }

    pub fn send_to_pipe(
        &mut self,
        current: usize,
        pipe: &PipeRef,
        value: Value,
    ) -> Result<SendOutcome, RuntimeError> {
        let reader = {
            let mut p = pipe.borrow_mut();
            if p.closed {
                return Err(RuntimeError::new("Send on closed pipe"));
            }
            let reader = self.pop_live(&mut p.readers);
            if reader.is_none() && p.buffer.len() < p.capacity {
                p.buffer.push_back(value.clone());
                drop(p);
                self.notify_select_waiters(pipe);
                return Ok(SendOutcome::Delivered);
            }
            reader
        };

        if let Some(reader) = reader {
            // Direct handoff: the reader parked with a null placeholder on
            // top of its stack.
            if let Some(thread) = self.threads.get_mut(&reader) {
                if let Some(top) = thread.stack.last_mut() {
                    *top = value;
                } else {
                    thread.stack.push(value);
                }
                thread.state = ThreadState::Ready;
                self.ready_queue.push_back(reader);
            }
            self.notify_select_waiters(pipe);
            return Ok(SendOutcome::Delivered);
        }

        // Full buffer and nobody waiting: park the sender with its value.
        pipe.borrow_mut().writers.push_back(current);
        if let Some(thread) = self.threads.get_mut(&current) {
            thread.pending_value = value;
            thread.state = ThreadState::Blocked;
            thread.wake_time = None;
        }
        // A parked writer makes receive cases ready.
        self.notify_select_waiters(pipe);
        Ok(SendOutcome::Blocked)
    }

    pub fn recv_from_pipe(
        &mut self,
        current: usize,
        pipe: &PipeRef,
    ) -> Result<RecvOutcome, RuntimeError> {
        enum Action {
            Buffered { value: Value, writer: Option<usize> },
            Handoff(usize),
            ClosedEmpty,
            Park,
        }

        let action = {
            let mut p = pipe.borrow_mut();
            if let Some(value) = p.buffer.pop_front() {
                let writer = self.pop_live(&mut p.writers);
                Action::Buffered { value, writer }
            } else if let Some(writer) = self.pop_live(&mut p.writers) {
                Action::Handoff(writer)
            } else if p.closed {
                Action::ClosedEmpty
            } else {
                p.readers.push_back(current);
                Action::Park
            }
        };

        match action {
            Action::Buffered { value, writer } => {
                // A parked writer's pending value moves into the freed
                // buffer slot, preserving send order.
                if let Some(writer) = writer {
                    if let Some(thread) = self.threads.get_mut(&writer) {
                        let pending =
                            std::mem::replace(&mut thread.pending_value, Value::Null);
                        pipe.borrow_mut().buffer.push_back(pending);
                        thread.state = ThreadState::Ready;
                        self.ready_queue.push_back(writer);
                    }
                }
                self.notify_select_waiters(pipe);
                Ok(RecvOutcome::Value(value))
            }
            Action::Handoff(writer) => {
                let value = match self.threads.get_mut(&writer) {
                    Some(thread) => {
                        let pending =
                            std::mem::replace(&mut thread.pending_value, Value::Null);
                        thread.state = ThreadState::Ready;
                        self.ready_queue.push_back(writer);
                        pending
                    }
                    None => Value::Null,
                };
                self.notify_select_waiters(pipe);
                Ok(RecvOutcome::Value(value))
            }
            Action::ClosedEmpty => Ok(RecvOutcome::Value(Value::Null)),
            Action::Park => {
                if let Some(thread) = self.threads.get_mut(&current) {
                    thread.state = ThreadState::Blocked;
                    thread.wake_time = None;
                }
                // A parked reader makes send cases ready.
                self.notify_select_waiters(pipe);
                Ok(RecvOutcome::Blocked)
            }
        }
    }

    pub fn close_pipe(&mut self, pipe: &PipeRef) -> Result<(), RuntimeError> {
        let readers: Vec<usize> = {
            let mut p = pipe.borrow_mut();
            if p.closed {
                return Ok(());
            }
            if p.writers.iter().any(|id| self.is_live(*id)) {
                return Err(RuntimeError::new("Close on pipe with blocked senders"));
            }
            p.closed = true;
            p.writers.clear();
            p.readers.drain(..).collect()
        };

        // Every parked reader observes the close as a null receive.
        for reader in readers {
            if let Some(thread) = self.threads.get_mut(&reader) {
                if thread.state != ThreadState::Blocked {
                    continue;
                }
                if let Some(top) = thread.stack.last_mut() {
                    *top = Value::Null;
                }
                thread.state = ThreadState::Ready;
                self.ready_queue.push_back(reader);
            }
        }
        self.notify_select_waiters(pipe);
        Ok(())
    }

    /// Readies every thread parked in a select that mentions this pipe.
    /// The woken threads rerun `SELECT_EXEC` and re-evaluate readiness.
    fn notify_select_waiters(&mut self, pipe: &PipeRef) {
        let waiters = std::mem::take(&mut pipe.borrow_mut().select_waiters);
        for id in waiters {
            if let Some(thread) = self.threads.get_mut(&id) {
                if thread.state == ThreadState::Blocked {
                    thread.state = ThreadState::Ready;
                    self.ready_queue.push_back(id);
                }
            }
        }
    }

    fn pop_live(&self, queue: &mut VecDeque<usize>) -> Option<usize> {
        while let Some(id) = queue.pop_front() {
            if self.is_live(id) {
                return Some(id);
            }
        }
        None
    }

    // ---- select --------------------------------------------------------

    pub fn select_begin(&mut self, id: usize, case_count: usize) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.active_select = Some(SelectFrame {
                cases: Vec::with_capacity(case_count),
                ..SelectFrame::default()
            });
        }
    }

    pub fn select_push_case(&mut self, id: usize, case: SelectCase) -> Result<(), RuntimeError> {
        match self.threads.get_mut(&id).and_then(|t| t.active_select.as_mut()) {
            Some(frame) => {
                frame.cases.push(case);
                Ok(())
            }
            None => Err(RuntimeError::new("Select case outside select")),
        }
    }

    pub fn select_set_default(&mut self, id: usize, target_ip: usize) -> Result<(), RuntimeError> {
        match self.threads.get_mut(&id).and_then(|t| t.active_select.as_mut()) {
            Some(frame) => {
                frame.has_default = true;
                frame.default_target_ip = target_ip;
                Ok(())
            }
            None => Err(RuntimeError::new("Select default outside select")),
        }
    }

    /// Drops the active select and removes this thread from every involved
    /// pipe's waiter list. Called when a case (or the default) commits.
    pub fn select_commit(&mut self, id: usize) {
        let frame = self
            .threads
            .get_mut(&id)
            .and_then(|t| t.active_select.take());
        if let Some(frame) = frame {
            for case in frame.cases {
                if let Some(pipe) = case.pipe {
                    pipe.borrow_mut().select_waiters.retain(|w| *w != id);
                }
            }
        }
    }

    /// Parks the thread on every live case pipe until one becomes ready.
    pub fn select_park(&mut self, id: usize) {
        let pipes: Vec<PipeRef> = self
            .threads
            .get(&id)
            .and_then(|t| t.active_select.as_ref())
            .map(|frame| frame.cases.iter().filter_map(|c| c.pipe.clone()).collect())
            .unwrap_or_default();
        for pipe in pipes {
            let mut p = pipe.borrow_mut();
            if !p.select_waiters.contains(&id) {
                p.select_waiters.push(id);
            }
        }
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Blocked;
            thread.wake_time = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler_with_threads(n: usize) -> Scheduler {
        let mut scheduler = Scheduler::new();
        for _ in 0..n {
            let id = scheduler.alloc_thread_id();
            let mut thread = GreenThread::new(id);
            // a placeholder slot, as if the thread parked mid-receive
            thread.stack.push(Value::Null);
            scheduler.add_thread(thread);
        }
        scheduler
    }

    #[test]
    fn buffered_pipe_accepts_capacity_sends_without_blocking() {
        let mut scheduler = scheduler_with_threads(1);
        let (_, pipe) = scheduler.create_pipe(3);
        for i in 0..3 {
            let outcome = scheduler
                .send_to_pipe(0, &pipe, Value::Int(i))
                .expect("send");
            assert!(matches!(outcome, SendOutcome::Delivered));
        }
        let outcome = scheduler
            .send_to_pipe(0, &pipe, Value::Int(99))
            .expect("send");
        assert!(matches!(outcome, SendOutcome::Blocked));
        assert_eq!(pipe.borrow().writers.len(), 1);
    }

    #[test]
    fn receive_preserves_send_order_through_a_parked_writer() {
        let mut scheduler = scheduler_with_threads(2);
        let (_, pipe) = scheduler.create_pipe(1);
        // thread 0 fills the buffer, then parks with a pending value
        assert!(matches!(
            scheduler.send_to_pipe(0, &pipe, Value::Int(1)).unwrap(),
            SendOutcome::Delivered
        ));
        assert!(matches!(
            scheduler.send_to_pipe(0, &pipe, Value::Int(2)).unwrap(),
            SendOutcome::Blocked
        ));

        // thread 1 receives: gets 1, and 2 moves into the buffer
        match scheduler.recv_from_pipe(1, &pipe).unwrap() {
            RecvOutcome::Value(v) => assert_eq!(v, Value::Int(1)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(pipe.borrow().buffer.front(), Some(&Value::Int(2)));
        // the writer is ready again
        assert_eq!(scheduler.state_of(0), Some(ThreadState::Ready));
        // buffer below capacity implies no blocked writers
        assert!(pipe.borrow().writers.is_empty());
    }

    #[test]
    fn rendezvous_pipe_hands_off_directly() {
        let mut scheduler = scheduler_with_threads(2);
        let (_, pipe) = scheduler.create_pipe(0);
        assert!(matches!(
            scheduler.recv_from_pipe(0, &pipe).unwrap(),
            RecvOutcome::Blocked
        ));
        assert!(matches!(
            scheduler.send_to_pipe(1, &pipe, Value::Int(7)).unwrap(),
            SendOutcome::Delivered
        ));
        // the parked reader's placeholder was overwritten
        assert_eq!(
            scheduler.threads.get(&0).unwrap().stack.last(),
            Some(&Value::Int(7))
        );
        assert_eq!(scheduler.state_of(0), Some(ThreadState::Ready));
        // buffer non-empty implies no blocked readers
        assert!(pipe.borrow().readers.is_empty());
    }

    #[test]
    fn send_on_closed_pipe_is_fatal() {
        let mut scheduler = scheduler_with_threads(1);
        let (_, pipe) = scheduler.create_pipe(1);
        scheduler.close_pipe(&pipe).unwrap();
        assert!(scheduler.send_to_pipe(0, &pipe, Value::Int(1)).is_err());
    }

    #[test]
    fn close_drains_then_yields_null_to_parked_readers() {
        let mut scheduler = scheduler_with_threads(1);
        let (_, pipe) = scheduler.create_pipe(0);
        assert!(matches!(
            scheduler.recv_from_pipe(0, &pipe).unwrap(),
            RecvOutcome::Blocked
        ));
        scheduler.close_pipe(&pipe).unwrap();
        assert_eq!(
            scheduler.threads.get(&0).unwrap().stack.last(),
            Some(&Value::Null)
        );
        assert_eq!(scheduler.state_of(0), Some(ThreadState::Ready));

        // a later receive on the closed pipe yields null immediately
        match scheduler.recv_from_pipe(0, &pipe).unwrap() {
            RecvOutcome::Value(Value::Null) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn close_with_blocked_writer_is_fatal() {
        let mut scheduler = scheduler_with_threads(1);
        let (_, pipe) = scheduler.create_pipe(0);
        assert!(matches!(
            scheduler.send_to_pipe(0, &pipe, Value::Int(1)).unwrap(),
            SendOutcome::Blocked
        ));
        assert!(scheduler.close_pipe(&pipe).is_err());
    }

    #[test]
    fn closed_pipe_buffer_drains_in_order() {
        let mut scheduler = scheduler_with_threads(2);
        let (_, pipe) = scheduler.create_pipe(2);
        scheduler.send_to_pipe(0, &pipe, Value::Int(1)).unwrap();
        scheduler.send_to_pipe(0, &pipe, Value::Int(2)).unwrap();
        scheduler.close_pipe(&pipe).unwrap();
        for expected in [Value::Int(1), Value::Int(2), Value::Null] {
            match scheduler.recv_from_pipe(1, &pipe).unwrap() {
                RecvOutcome::Value(v) => assert_eq!(v, expected),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn join_on_finished_thread_returns_immediately() {
        let mut scheduler = scheduler_with_threads(2);
        scheduler.set_return_value(1, Value::Int(42));
        scheduler.threads.get_mut(&1).unwrap().state = ThreadState::Finished;
        match scheduler.join(0, 1) {
            JoinOutcome::Done(v) => assert_eq!(v, Value::Int(42)),
            JoinOutcome::Blocked => panic!("join should not block"),
        }
    }

    #[test]
    fn join_waiter_is_woken_at_front_of_queue_with_the_value() {
        let mut scheduler = scheduler_with_threads(3);
        assert!(matches!(scheduler.join(0, 1), JoinOutcome::Blocked));
        scheduler.enqueue(2);
        scheduler.set_return_value(1, Value::Int(9));
        scheduler.threads.get_mut(&1).unwrap().state = ThreadState::Finished;
        scheduler.notify_join_waiters(1);
        assert_eq!(scheduler.ready_queue.front(), Some(&0));
        assert_eq!(
            scheduler.threads.get(&0).unwrap().stack.last(),
            Some(&Value::Int(9))
        );
    }

    #[test]
    fn killing_a_thread_cascades_to_descendants() {
        let mut scheduler = scheduler_with_threads(3);
        scheduler.threads.get_mut(&0).unwrap().children.push(1);
        scheduler.threads.get_mut(&1).unwrap().children.push(2);
        scheduler.kill_thread_and_children(0);
        assert!(scheduler.threads.is_empty());
    }

    #[test]
    fn dead_reader_entries_are_skipped_on_send() {
        let mut scheduler = scheduler_with_threads(3);
        let (_, pipe) = scheduler.create_pipe(0);
        assert!(matches!(
            scheduler.recv_from_pipe(0, &pipe).unwrap(),
            RecvOutcome::Blocked
        ));
        assert!(matches!(
            scheduler.recv_from_pipe(1, &pipe).unwrap(),
            RecvOutcome::Blocked
        ));
        // thread 0 gets cancelled while parked
        scheduler.kill_thread_and_children(0);
        scheduler.send_to_pipe(2, &pipe, Value::Int(5)).unwrap();
        assert_eq!(
            scheduler.threads.get(&1).unwrap().stack.last(),
            Some(&Value::Int(5))
        );
    }

    #[test]
    fn sleep_wakes_in_deadline_order() {
        let mut scheduler = scheduler_with_threads(2);
        scheduler.send_to_sleep(0, 50);
        scheduler.send_to_sleep(1, 10);
        scheduler.block_sleeping(0);
        scheduler.block_sleeping(1);
        let far_future = Instant::now() + Duration::from_secs(1);
        scheduler.wake_threads(far_future);
        assert_eq!(scheduler.ready_queue, VecDeque::from(vec![1, 0]));
    }
}
