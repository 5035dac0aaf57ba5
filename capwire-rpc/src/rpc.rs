// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The connection state machine: the four tables, message dispatch, and the client hooks that
//! stand for capabilities living on the other side of a connection.

use capwire::capability::{self, Promise, RemotePromise};
use capwire::private::capability::{
    ClientHook, ParamsHook, PipelineHook, PipelineOp, RequestHook, ResponseHook, ResultsHook,
};
use capwire::{any_pointer, Error, ErrorKind, MessageSize};

use futures::channel::oneshot;
use futures::{future, Future, FutureExt, TryFutureExt};

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::local::ResultsDoneHook;
use crate::rpc_capnp::{
    call, cap_descriptor, disembargo, exception, message, message_target, payload,
    promised_answer, resolve, return_, struct_list,
};
use crate::sender_queue::SenderQueue;
use crate::task_set::{TaskReaper, TaskSet, TaskSetHandle};
use crate::{broken, local, queued};

pub type QuestionId = u32;
pub type AnswerId = QuestionId;
pub type ExportId = u32;
pub type ImportId = ExportId;

type MessageBuilder = capwire::message::Builder<capwire::message::HeapAllocator>;

/// Lifecycle of a connection, as reported by [`crate::RpcSystem::connection_phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Created, message loop not yet running. Outgoing messages wait in the write queue.
    Connecting,
    Established,
    /// Shutting down after a clean disconnect.
    Closing,
    /// Shutting down after an error or an `Abort` from the peer.
    Failed,
}

/// Live entries in each table of a connection. A connection where every call has finished
/// and every capability has been released reports all zeros.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableSizes {
    pub questions: usize,
    pub answers: usize,
    pub exports: usize,
    pub imports: usize,
}

/// Ids chosen by the other side.
pub struct ImportTable<T> {
    slots: HashMap<u32, T>,
}

impl<T> ImportTable<T> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Ids chosen by this side. Freed ids are handed out again, smallest first.
struct ExportTable<T> {
    slots: Vec<Option<T>>,
    free_ids: BinaryHeap<Reverse<u32>>,
}

impl<T> ExportTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: BinaryHeap::new(),
        }
    }

    fn erase(&mut self, id: u32) -> Option<T> {
        let removed = self.slots.get_mut(id as usize).and_then(Option::take);
        if removed.is_some() {
            self.free_ids.push(Reverse(id));
        }
        removed
    }

    fn push(&mut self, val: T) -> u32 {
        match self.free_ids.pop() {
            Some(Reverse(id)) => {
                self.slots[id as usize] = Some(val);
                id
            }
            None => {
                self.slots.push(Some(val));
                self.slots.len() as u32 - 1
            }
        }
    }

    fn find(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    fn len(&self) -> usize {
        self.iter().count()
    }

    fn take_all(&mut self) -> Vec<T> {
        self.free_ids.clear();
        mem::take(&mut self.slots).into_iter().flatten().collect()
    }
}

struct Question<VatId>
where
    VatId: 'static,
{
    is_awaiting_return: bool,
    param_exports: Vec<ExportId>,
    self_ref: Option<Weak<RefCell<QuestionRef<VatId>>>>,
}

impl<VatId> Question<VatId> {
    fn new() -> Self {
        Self {
            is_awaiting_return: true,
            param_exports: Vec::new(),
            self_ref: None,
        }
    }
}

/// The caller's handle on an outstanding question. Dropping the last one sends `Finish`.
pub struct QuestionRef<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    id: QuestionId,
    fulfiller: Option<oneshot::Sender<Promise<Response<VatId>, Error>>>,
}

impl<VatId> QuestionRef<VatId> {
    fn new(
        state: Rc<ConnectionState<VatId>>,
        id: QuestionId,
        fulfiller: oneshot::Sender<Promise<Response<VatId>, Error>>,
    ) -> Self {
        Self {
            connection_state: state,
            id,
            fulfiller: Some(fulfiller),
        }
    }

    fn fulfill(&mut self, response: Promise<Response<VatId>, Error>) {
        if let Some(fulfiller) = self.fulfiller.take() {
            let _ = fulfiller.send(response);
        }
    }

    fn reject(&mut self, err: Error) {
        if let Some(fulfiller) = self.fulfiller.take() {
            let _ = fulfiller.send(Promise::err(err));
        }
    }
}

impl<VatId> Drop for QuestionRef<VatId> {
    fn drop(&mut self) {
        let awaiting_return = {
            let mut questions = self.connection_state.questions.borrow_mut();
            let Some(question) = questions.find(self.id) else {
                return;
            };
            if question.is_awaiting_return {
                // Keep the id reserved until the late Return shows up.
                question.self_ref = None;
                true
            } else {
                questions.erase(self.id);
                false
            }
        };
        tracing::debug!(
            question_id = self.id,
            canceled = awaiting_return,
            "question finished"
        );
        if self.connection_state.connection.borrow().is_ok() {
            // With releaseResultCaps set the peer drops whatever it returns for a canceled call.
            if let Err(e) = self.connection_state.send_finish(self.id, awaiting_return) {
                tracing::debug!(question_id = self.id, error = %e, "could not send finish");
            }
        }
    }
}

struct Answer {
    /// The peer has asked this question and not yet finished it.
    active: bool,
    return_has_been_sent: bool,
    pipeline: Option<Box<dyn PipelineHook>>,
    received_finish: Rc<Cell<bool>>,
    call_completion_promise: Option<Promise<(), Error>>,
    result_exports: Vec<ExportId>,
}

impl Answer {
    fn new() -> Self {
        Self {
            active: false,
            return_has_been_sent: false,
            pipeline: None,
            received_finish: Rc::new(Cell::new(false)),
            call_completion_promise: None,
            result_exports: Vec::new(),
        }
    }
}

pub struct Export {
    refcount: u32,
    client_hook: Box<dyn ClientHook>,
    resolve_op: Option<Promise<(), Error>>,
}

impl Export {
    fn new(client_hook: Box<dyn ClientHook>) -> Self {
        Self {
            refcount: 1,
            client_hook,
            resolve_op: None,
        }
    }
}

pub struct Import<VatId>
where
    VatId: 'static,
{
    import_client: Option<(Weak<RefCell<ImportClient<VatId>>>, usize)>,

    /// What application code sees for this import. A promise import hands out a
    /// `PromiseClient` here so that later imports of the same id share its resolution.
    app_client: Option<WeakClient<VatId>>,

    promise_client_to_resolve: Option<Weak<RefCell<PromiseClient<VatId>>>>,
}

impl<VatId> Import<VatId> {
    fn new() -> Self {
        Self {
            import_client: None,
            app_client: None,
            promise_client_to_resolve: None,
        }
    }
}

struct Embargo {
    fulfiller: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Embargo {
    fn new(fulfiller: oneshot::Sender<Result<(), Error>>) -> Self {
        Self {
            fulfiller: Some(fulfiller),
        }
    }
}

fn to_pipeline_ops(
    ops: struct_list::Reader<'_, promised_answer::op::Owned>,
) -> capwire::Result<Vec<PipelineOp>> {
    ops.iter()
        .map(|op| op.which().map_err(Error::from))
        .collect()
}

fn write_pipeline_ops(
    ops: &[PipelineOp],
    builder: promised_answer::Builder<'_>,
) -> capwire::Result<()> {
    let mut transform = builder.init_transform(ops.len() as u32)?;
    for (idx, op) in ops.iter().enumerate() {
        match op {
            PipelineOp::Noop => transform.reborrow().get(idx as u32).set_noop(),
            PipelineOp::GetPointerField(ordinal) => transform
                .reborrow()
                .get(idx as u32)
                .set_get_pointer_field(*ordinal),
        }
    }
    Ok(())
}

fn from_error(error: &Error, mut builder: exception::Builder<'_>) -> capwire::Result<()> {
    builder.set_reason(&error.extra)?;
    builder.set_type(error.kind);
    Ok(())
}

fn remote_exception_to_error(exception: exception::Reader<'_>) -> Error {
    match (exception.get_type(), exception.get_reason()) {
        (Ok(kind), Ok(reason)) => {
            Error::from_kind_context(kind, format!("remote exception: {reason}"))
        }
        _ => Error::failed("remote exception: (malformed exception)".into()),
    }
}

fn send_outgoing(
    message: Box<dyn crate::OutgoingMessage>,
    kind: &'static str,
) -> (Promise<Rc<MessageBuilder>, Error>, Rc<MessageBuilder>) {
    tracing::trace!(kind, words = message.size_in_words(), "outbound message");
    message.send()
}

fn get_call(
    message: &mut Box<dyn crate::OutgoingMessage>,
) -> capwire::Result<call::Builder<'_>> {
    message.get_body()?.get_as::<message::Builder>()?.get_call()
}

fn get_return_results(
    message: &mut Box<dyn crate::OutgoingMessage>,
) -> capwire::Result<payload::Builder<'_>> {
    message
        .get_body()?
        .get_as::<message::Builder>()?
        .get_return()?
        .get_results()
}

fn broken_remote_promise(error: Error) -> RemotePromise {
    RemotePromise {
        promise: Promise::err(error.clone()),
        pipeline: any_pointer::Pipeline::new(Box::new(broken::Pipeline::new(error))),
    }
}

struct ConnectionErrorHandler<VatId>
where
    VatId: 'static,
{
    weak_state: Weak<ConnectionState<VatId>>,
}

impl<VatId> ConnectionErrorHandler<VatId> {
    fn new(weak_state: Weak<ConnectionState<VatId>>) -> Self {
        Self { weak_state }
    }
}

impl<VatId> TaskReaper<Error> for ConnectionErrorHandler<VatId> {
    fn task_failed(&mut self, error: Error) {
        if let Some(state) = self.weak_state.upgrade() {
            state.disconnect(error)
        }
    }
}

pub struct ConnectionState<VatId>
where
    VatId: 'static,
{
    bootstrap_cap: Box<dyn ClientHook>,
    exports: RefCell<ExportTable<Export>>,
    questions: RefCell<ExportTable<Question<VatId>>>,
    answers: RefCell<ImportTable<Answer>>,
    imports: RefCell<ImportTable<Import<VatId>>>,

    exports_by_cap: RefCell<HashMap<usize, ExportId>>,
    embargoes: RefCell<ExportTable<Embargo>>,

    tasks: RefCell<Option<TaskSetHandle<Error>>>,
    pub connection: RefCell<Result<Box<dyn crate::Connection<VatId>>, Error>>,
    disconnect_fulfiller: RefCell<Option<oneshot::Sender<Promise<(), Error>>>>,

    phase: Cell<ConnectionPhase>,

    /// Maps `get_ptr()` of the RPC client hooks handed out by this connection back to them.
    client_downcast_map: RefCell<HashMap<usize, WeakClient<VatId>>>,
}

impl<VatId> ConnectionState<VatId> {
    pub fn new(
        bootstrap_cap: Box<dyn ClientHook>,
        connection: Box<dyn crate::Connection<VatId>>,
        disconnect_fulfiller: oneshot::Sender<Promise<(), Error>>,
    ) -> (TaskSet<Error>, Rc<Self>) {
        let state = Rc::new(Self {
            bootstrap_cap,
            exports: RefCell::new(ExportTable::new()),
            questions: RefCell::new(ExportTable::new()),
            answers: RefCell::new(ImportTable::new()),
            imports: RefCell::new(ImportTable::new()),
            exports_by_cap: RefCell::new(HashMap::new()),
            embargoes: RefCell::new(ExportTable::new()),
            tasks: RefCell::new(None),
            connection: RefCell::new(Ok(connection)),
            disconnect_fulfiller: RefCell::new(Some(disconnect_fulfiller)),
            phase: Cell::new(ConnectionPhase::Connecting),
            client_downcast_map: RefCell::new(HashMap::new()),
        });
        let (mut handle, tasks) =
            TaskSet::new(Box::new(ConnectionErrorHandler::new(Rc::downgrade(&state))));

        handle.add(Self::message_loop(Rc::downgrade(&state)));
        *state.tasks.borrow_mut() = Some(handle);
        tracing::info!(phase = ?ConnectionPhase::Connecting, "rpc connection created");
        (tasks, state)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.get()
    }

    pub fn table_sizes(&self) -> TableSizes {
        TableSizes {
            questions: self.questions.borrow().len(),
            answers: self.answers.borrow().len(),
            exports: self.exports.borrow().len(),
            imports: self.imports.borrow().len(),
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.replace(phase);
        if previous != phase {
            tracing::info!(from = ?previous, to = ?phase, "rpc connection phase changed");
        }
    }

    fn new_outgoing_message(
        &self,
        first_segment_words: u32,
    ) -> capwire::Result<Box<dyn crate::OutgoingMessage>> {
        match self.connection.borrow_mut().as_mut() {
            Err(e) => Err(e.clone()),
            Ok(c) => Ok(c.new_outgoing_message(first_segment_words)),
        }
    }

    fn max_message_words(&self) -> Option<usize> {
        self.connection
            .borrow()
            .as_ref()
            .ok()
            .and_then(|c| c.max_message_words())
    }

    /// Tears the connection down. Pending questions fail with a `Disconnected` error and the
    /// tables are emptied. Only the first call has any effect.
    pub fn disconnect(&self, error: Error) {
        if self.connection.borrow().is_err() {
            return;
        }

        let failed = error.kind != ErrorKind::Disconnected;
        if failed {
            tracing::warn!(error = %error, "rpc connection failed");
            self.set_phase(ConnectionPhase::Failed);
        } else {
            self.set_phase(ConnectionPhase::Closing);
        }
        let disconnected = if failed {
            Error::disconnected(format!("connection failed: {error}"))
        } else {
            error.clone()
        };

        let question_refs: Vec<_> = self
            .questions
            .borrow()
            .iter()
            .filter_map(|q| q.self_ref.as_ref().and_then(Weak::upgrade))
            .collect();
        for question_ref in &question_refs {
            question_ref.borrow_mut().reject(disconnected.clone());
        }

        let answers: Vec<Answer> = self
            .answers
            .borrow_mut()
            .slots
            .drain()
            .map(|(_, answer)| answer)
            .collect();
        let exports = self.exports.borrow_mut().take_all();
        self.exports_by_cap.borrow_mut().clear();

        let promise_clients: Vec<_> = self
            .imports
            .borrow_mut()
            .slots
            .values_mut()
            .filter_map(|import| import.promise_client_to_resolve.take())
            .filter_map(|weak| weak.upgrade())
            .collect();
        for client in &promise_clients {
            client.borrow_mut().resolve(Err(disconnected.clone()));
        }

        let embargoes = self.embargoes.borrow_mut().take_all();
        for mut embargo in embargoes {
            if let Some(fulfiller) = embargo.fulfiller.take() {
                let _ = fulfiller.send(Err(disconnected.clone()));
            }
        }

        if let Ok(c) = self.connection.borrow_mut().as_mut() {
            let mut message = c.new_outgoing_message(100);
            let written = message
                .get_body()
                .and_then(|body| body.init_as::<message::Builder>())
                .and_then(|m| m.init_abort())
                .and_then(|abort| from_error(&error, abort));
            if written.is_ok() {
                tracing::warn!(error = %error, "sending abort");
                let _ = message.send();
            }
        }

        let connection = mem::replace(&mut *self.connection.borrow_mut(), Err(disconnected));
        if let Ok(mut c) = connection {
            let shutdown = c.shutdown(Err(error)).then(|result| {
                future::ready(match result {
                    Err(e) if e.kind != ErrorKind::Disconnected => Err(e),
                    _ => Ok(()),
                })
            });
            if let Some(fulfiller) = self.disconnect_fulfiller.borrow_mut().take() {
                let _ = fulfiller.send(Promise::from_future(shutdown.map(move |result| {
                    drop(c);
                    result
                })));
            }
        }

        drop((question_refs, answers, exports, promise_clients));
    }

    /// Runs `task` on the connection's task set and returns a promise for its result.
    /// Dropping the returned promise cancels the task.
    fn eagerly_evaluate<T, F>(&self, task: F) -> Promise<T, Error>
    where
        F: Future<Output = Result<T, Error>> + Unpin + 'static,
        T: 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        let (tx2, rx2) = oneshot::channel::<()>();
        let f1 = Box::pin(task.map(move |r| {
            let _ = tx.send(r);
        }));
        let f2 = Box::pin(rx2.map(drop));

        self.add_task(future::select(f1, f2).map(|_| Ok(())));
        Promise::from_future(rx.map_err(crate::canceled_to_error).map(move |r| {
            drop(tx2);
            r?
        }))
    }

    fn add_task<F>(&self, task: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        if let Some(tasks) = self.tasks.borrow_mut().as_mut() {
            tasks.add(task);
        }
    }

    pub fn bootstrap(state: &Rc<Self>) -> Box<dyn ClientHook> {
        let question_id = state.questions.borrow_mut().push(Question::new());

        let (fulfiller, promise) = oneshot::channel();
        let promise = promise
            .map_err(crate::canceled_to_error)
            .and_then(|response| response);
        let question_ref = Rc::new(RefCell::new(QuestionRef::new(
            state.clone(),
            question_id,
            fulfiller,
        )));
        if let Some(question) = state.questions.borrow_mut().find(question_id) {
            question.self_ref = Some(Rc::downgrade(&question_ref));
        }
        let held = question_ref.clone();
        let promise = promise.map(move |result| {
            drop(held);
            result
        });

        if let Err(e) = state.send_bootstrap(question_id) {
            question_ref.borrow_mut().reject(e);
        } else {
            tracing::debug!(question_id, "bootstrap question sent");
        }

        let pipeline = Pipeline::new(state.clone(), question_ref, Promise::from_future(promise));
        pipeline.get_pipelined_cap_move(Vec::new())
    }

    fn send_bootstrap(&self, question_id: QuestionId) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(5)?;
        message
            .get_body()?
            .init_as::<message::Builder>()?
            .init_bootstrap()?
            .set_question_id(question_id);
        let _ = send_outgoing(message, "bootstrap");
        Ok(())
    }

    fn send_finish(
        &self,
        question_id: QuestionId,
        release_result_caps: bool,
    ) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(5)?;
        {
            let mut finish = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_finish()?;
            finish.set_question_id(question_id);
            finish.set_release_result_caps(release_result_caps);
        }
        let _ = send_outgoing(message, "finish");
        Ok(())
    }

    fn send_release(&self, import_id: ImportId, count: u32) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(5)?;
        {
            let mut release = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_release()?;
            release.set_id(import_id);
            release.set_reference_count(count);
        }
        let _ = send_outgoing(message, "release");
        Ok(())
    }

    fn send_return_canceled(&self, answer_id: AnswerId) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(5)?;
        {
            let mut ret = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_return()?;
            ret.set_answer_id(answer_id);
            ret.set_release_param_caps(false);
            ret.set_canceled();
        }
        let _ = send_outgoing(message, "return");
        Ok(())
    }

    fn send_return_exception(&self, answer_id: AnswerId, error: &Error) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(50)?;
        {
            let mut ret = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_return()?;
            ret.set_answer_id(answer_id);
            ret.set_release_param_caps(false);
            from_error(error, ret.init_exception()?)?;
        }
        let _ = send_outgoing(message, "return");
        Ok(())
    }

    fn send_disembargo_loopback(
        &self,
        embargo_id: u32,
        target: &dyn ClientHook,
    ) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(50)?;
        {
            let mut disembargo = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_disembargo()?;
            disembargo.set_sender_loopback(embargo_id);
            if self.write_target(target, disembargo.init_target()?)?.is_some() {
                return Err(Error::failed(
                    "original promise target should always be from this RPC connection".into(),
                ));
            }
        }
        let _ = send_outgoing(message, "disembargo");
        Ok(())
    }

    fn send_disembargo_reply(
        &self,
        embargo_id: u32,
        target: &dyn ClientHook,
    ) -> capwire::Result<()> {
        let mut message = self.new_outgoing_message(50)?;
        {
            let mut disembargo = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_disembargo()?;
            disembargo.set_receiver_loopback(embargo_id);
            let Some(client) = Client::from_ptr(target.get_ptr(), self) else {
                return Err(Error::failed(
                    "'Disembargo' target is not a capability of this connection".into(),
                ));
            };
            if client.write_target(disembargo.init_target()?)?.is_some() {
                return Err(Error::failed(
                    "'Disembargo' of type 'senderLoopback' sent to an object that does not \
                     appear to have been the subject of a previous 'Resolve' message"
                        .into(),
                ));
            }
        }
        let _ = send_outgoing(message, "disembargo");
        Ok(())
    }

    fn send_unimplemented(&self, message: message::Reader<'_>) -> capwire::Result<()> {
        tracing::debug!(kind = message.kind_name(), "replying unimplemented");
        let mut out = self.new_outgoing_message(50)?;
        out.get_body()?
            .init_as::<message::Builder>()?
            .set_unimplemented(message)?;
        let _ = send_outgoing(out, "unimplemented");
        Ok(())
    }

    fn message_loop(weak_state: Weak<Self>) -> Promise<(), Error> {
        Promise::from_future(async move {
            let receive = {
                let Some(state) = weak_state.upgrade() else {
                    return Err(Error::disconnected(
                        "message loop cannot continue without a connection".into(),
                    ));
                };
                if state.phase.get() == ConnectionPhase::Connecting {
                    state.set_phase(ConnectionPhase::Established);
                }
                let mut connection = state.connection.borrow_mut();
                match connection.as_mut() {
                    Err(_) => return Ok(()),
                    Ok(c) => c.receive_incoming_message(),
                }
            };

            match receive.await? {
                Some(message) => {
                    Self::handle_message(&weak_state, message)?;
                    if let Some(state) = weak_state.upgrade() {
                        state.add_task(Self::message_loop(weak_state));
                    }
                }
                None => {
                    if let Some(state) = weak_state.upgrade() {
                        state.disconnect(Error::disconnected("peer disconnected".into()));
                    }
                }
            }
            Ok(())
        })
    }

    fn handle_message(
        weak_state: &Weak<Self>,
        mut message: Box<dyn crate::IncomingMessage>,
    ) -> capwire::Result<()> {
        let Some(connection_state) = weak_state.upgrade() else {
            return Err(Error::disconnected(
                "handle_message() cannot continue without a connection".into(),
            ));
        };

        let reader = message.get_body()?.get_as::<message::Reader>()?;
        tracing::trace!(kind = reader.kind_name(), "inbound message");
        match reader.which() {
            Ok(message::Which::Unimplemented(echoed)) => {
                let echoed = echoed?;
                match echoed.which()? {
                    message::Which::Resolve(resolve) => {
                        let resolve = resolve?;
                        if let resolve::Which::Cap(c) = resolve.which()? {
                            match c?.which()? {
                                cap_descriptor::Which::SenderHosted(export_id)
                                | cap_descriptor::Which::SenderPromise(export_id) => {
                                    connection_state.release_export(export_id, 1)?;
                                }
                                _ => (),
                            }
                        }
                    }
                    _ => {
                        return Err(Error::failed(format!(
                            "peer did not implement required RPC message type {}",
                            echoed.kind_name()
                        )));
                    }
                }
            }
            Ok(message::Which::Abort(abort)) => {
                let error = remote_exception_to_error(abort?);
                tracing::warn!(error = %error, "peer aborted the connection");
                return Err(error);
            }
            Ok(message::Which::Bootstrap(bootstrap)) => {
                let answer_id = bootstrap?.get_question_id();
                Self::handle_bootstrap(&connection_state, answer_id)?;
            }
            Ok(message::Which::Call(call)) => {
                let (target, interface_id, method_id, question_id, caps) = {
                    let call = call?;
                    match call.get_send_results_to()? {
                        call::SendResultsTo::Caller => (),
                        call::SendResultsTo::Yourself => {
                            return Err(Error::unimplemented(
                                "Call.sendResultsTo.yourself is not supported".into(),
                            ));
                        }
                        call::SendResultsTo::ThirdParty => {
                            return Err(Error::unimplemented(
                                "Call.sendResultsTo.thirdParty is not supported".into(),
                            ));
                        }
                    }
                    let target = connection_state.get_message_target(call.get_target()?)?;
                    let caps =
                        Self::receive_caps(&connection_state, call.get_params()?.get_cap_table()?)?;
                    (
                        target,
                        call.get_interface_id(),
                        call.get_method_id(),
                        call.get_question_id(),
                        caps,
                    )
                };
                message.set_cap_table(caps);
                Self::handle_call(
                    &connection_state,
                    question_id,
                    target,
                    interface_id,
                    method_id,
                    message,
                )?;
            }
            Ok(message::Which::Return(ret)) => {
                let ret = ret?;
                let question_id = ret.get_answer_id();
                let (question_ref, param_exports) = {
                    let mut questions = connection_state.questions.borrow_mut();
                    let Some(question) = questions.find(question_id) else {
                        return Err(Error::failed(format!(
                            "invalid question ID {question_id} in Return message"
                        )));
                    };
                    if !question.is_awaiting_return {
                        return Err(Error::failed(format!(
                            "duplicate Return for question {question_id}"
                        )));
                    }
                    question.is_awaiting_return = false;
                    let param_exports = if ret.get_release_param_caps() {
                        mem::take(&mut question.param_exports)
                    } else {
                        Vec::new()
                    };
                    match question.self_ref.as_ref().and_then(Weak::upgrade) {
                        Some(question_ref) => (Some(question_ref), param_exports),
                        None => {
                            // The caller gave up; its Finish already asked the peer to release
                            // any result caps, so none are imported here.
                            questions.erase(question_id);
                            tracing::debug!(question_id, "ignoring return for canceled question");
                            (None, param_exports)
                        }
                    }
                };
                connection_state.release_exports(&param_exports)?;
                let Some(question_ref) = question_ref else {
                    return Ok(());
                };

                match ret.which()? {
                    return_::Which::Results(results) => {
                        let caps =
                            Self::receive_caps(&connection_state, results?.get_cap_table()?)?;
                        message.set_cap_table(caps);
                        let response =
                            Response::new(connection_state.clone(), question_ref.clone(), message);
                        question_ref.borrow_mut().fulfill(Promise::ok(response));
                    }
                    return_::Which::Exception(e) => {
                        let error = remote_exception_to_error(e?);
                        question_ref.borrow_mut().reject(error);
                    }
                    return_::Which::Canceled => {
                        question_ref
                            .borrow_mut()
                            .reject(Error::failed("call was canceled".into()));
                    }
                    return_::Which::ResultsSentElsewhere
                    | return_::Which::TakeFromOtherQuestion(_)
                    | return_::Which::AcceptFromThirdParty => {
                        let error = Error::unimplemented(
                            "Return variant for redirected results is not supported".into(),
                        );
                        question_ref.borrow_mut().reject(error.clone());
                        return Err(error);
                    }
                }
            }
            Ok(message::Which::Finish(finish)) => {
                let finish = finish?;
                let answer_id = finish.get_question_id();
                let (exports_to_release, released, send_canceled) = {
                    let mut answers = connection_state.answers.borrow_mut();
                    let Some(answer) = answers.slots.get_mut(&answer_id) else {
                        return Err(Error::failed(format!(
                            "invalid question ID {answer_id} in Finish message"
                        )));
                    };
                    if !answer.active {
                        return Err(Error::failed(format!(
                            "'Finish' for invalid question ID {answer_id}"
                        )));
                    }
                    answer.received_finish.set(true);
                    let exports = if finish.get_release_result_caps() {
                        mem::take(&mut answer.result_exports)
                    } else {
                        Vec::new()
                    };
                    let send_canceled = !answer.return_has_been_sent;
                    let pipeline = answer.pipeline.take();
                    let completion = answer.call_completion_promise.take();
                    let removed = answers.slots.remove(&answer_id);
                    (exports, (pipeline, completion, removed), send_canceled)
                };
                if send_canceled {
                    tracing::debug!(answer_id, "call canceled by the caller");
                    connection_state.send_return_canceled(answer_id)?;
                } else {
                    tracing::debug!(answer_id, "answer finished");
                }
                drop(released);
                connection_state.release_exports(&exports_to_release)?;
            }
            Ok(message::Which::Resolve(resolve)) => {
                let resolve = resolve?;
                let replacement = match resolve.which()? {
                    resolve::Which::Cap(c) => match Self::receive_cap(&connection_state, c?)? {
                        Some(cap) => Ok(cap),
                        None => {
                            return Err(Error::failed(
                                "'Resolve' contained 'CapDescriptor.none'".into(),
                            ));
                        }
                    },
                    resolve::Which::Exception(e) => Err(remote_exception_to_error(e?)),
                };
                let promise_id = resolve.get_promise_id();
                let promise_client = {
                    let mut imports = connection_state.imports.borrow_mut();
                    match imports.slots.get_mut(&promise_id) {
                        Some(import) => match import.promise_client_to_resolve.take() {
                            Some(weak) => weak.upgrade(),
                            None => {
                                return Err(Error::failed(
                                    "got 'Resolve' for a non-promise import".into(),
                                ));
                            }
                        },
                        // The import is gone already; dropping the replacement releases it.
                        None => None,
                    }
                };
                if let Some(client) = promise_client {
                    client.borrow_mut().resolve(replacement);
                }
            }
            Ok(message::Which::Release(release)) => {
                let release = release?;
                connection_state.release_export(release.get_id(), release.get_reference_count())?;
            }
            Ok(message::Which::Disembargo(disembargo)) => {
                let disembargo = disembargo?;
                match disembargo.get_context()? {
                    disembargo::Context::SenderLoopback(embargo_id) => {
                        let mut target =
                            connection_state.get_message_target(disembargo.get_target()?)?;
                        while let Some(resolved) = target.get_resolved() {
                            target = resolved;
                        }
                        if target.get_brand() != connection_state.get_brand() {
                            return Err(Error::failed(
                                "'Disembargo' of type 'senderLoopback' sent to an object that \
                                 does not point back to the sender"
                                    .into(),
                            ));
                        }
                        // Reply from a later turn so that calls queued ahead of it go out first.
                        let weak_state = Rc::downgrade(&connection_state);
                        connection_state.add_task(async move {
                            match weak_state.upgrade() {
                                Some(state) => state.send_disembargo_reply(embargo_id, &*target),
                                None => Ok(()),
                            }
                        });
                    }
                    disembargo::Context::ReceiverLoopback(embargo_id) => {
                        let fulfiller = {
                            let mut embargoes = connection_state.embargoes.borrow_mut();
                            let fulfiller =
                                embargoes.find(embargo_id).and_then(|e| e.fulfiller.take());
                            embargoes.erase(embargo_id);
                            fulfiller
                        };
                        match fulfiller {
                            Some(fulfiller) => {
                                tracing::debug!(embargo_id, "embargo lifted");
                                let _ = fulfiller.send(Ok(()));
                            }
                            None => {
                                return Err(Error::failed(format!(
                                    "invalid embargo ID {embargo_id} in receiverLoopback"
                                )));
                            }
                        }
                    }
                    disembargo::Context::Accept | disembargo::Context::Provide(_) => {
                        return Err(Error::unimplemented(
                            "Disembargo::Context::Provide/Accept not implemented".into(),
                        ));
                    }
                }
            }
            Ok(
                message::Which::ObsoleteSave
                | message::Which::ObsoleteDelete
                | message::Which::Provide
                | message::Which::Accept
                | message::Which::Join,
            )
            | Err(capwire::NotInSchema(_)) => {
                connection_state.send_unimplemented(reader)?;
            }
        }
        Ok(())
    }

    fn handle_bootstrap(connection_state: &Rc<Self>, answer_id: AnswerId) -> capwire::Result<()> {
        if connection_state.connection.borrow().is_err() {
            return Ok(());
        }

        let mut response = connection_state.new_outgoing_message(50)?;
        {
            let mut ret = response
                .get_body()?
                .init_as::<message::Builder>()?
                .init_return()?;
            ret.set_answer_id(answer_id);
            ret.set_release_param_caps(false);
            ret.init_results()?
                .get_content()
                .set_as_capability(connection_state.bootstrap_cap.clone());
        }
        let cap_table = response.cap_table();
        let result_exports = {
            let results = get_return_results(&mut response)?;
            Self::write_descriptors(connection_state, &cap_table, results)?
        };

        let already_active = {
            let mut answers = connection_state.answers.borrow_mut();
            let answer = answers.slots.entry(answer_id).or_insert_with(Answer::new);
            if answer.active {
                true
            } else {
                answer.active = true;
                answer.return_has_been_sent = true;
                answer.result_exports = result_exports.clone();
                answer.pipeline = Some(Box::new(SingleCapPipeline::new(
                    connection_state.bootstrap_cap.clone(),
                )));
                false
            }
        };
        if already_active {
            connection_state.release_exports(&result_exports)?;
            return Err(Error::failed("questionId is already in use".into()));
        }

        tracing::debug!(answer_id, "bootstrap answered");
        let _ = send_outgoing(response, "return");
        Ok(())
    }

    fn handle_call(
        connection_state: &Rc<Self>,
        question_id: QuestionId,
        target: Box<dyn ClientHook>,
        interface_id: u64,
        method_id: u16,
        request: Box<dyn crate::IncomingMessage>,
    ) -> capwire::Result<()> {
        if connection_state
            .answers
            .borrow()
            .slots
            .get(&question_id)
            .is_some_and(|answer| answer.active)
        {
            return Err(Error::failed(format!(
                "received a new call on in-use question id {question_id}"
            )));
        }

        let answer = Answer::new();
        let (results_inner_fulfiller, results_inner_promise) = oneshot::channel();
        let results_inner_promise = results_inner_promise.map_err(crate::canceled_to_error);
        let results = Results::new(
            connection_state,
            question_id,
            results_inner_fulfiller,
            answer.received_finish.clone(),
        );
        let params = Params::new(request);

        {
            let mut answers = connection_state.answers.borrow_mut();
            let answer = answers.slots.entry(question_id).or_insert(answer);
            answer.active = true;
        }
        tracing::debug!(question_id, interface_id, method_id, "answer created");

        let call_promise =
            target.call(interface_id, method_id, Box::new(params), Box::new(results));
        let (pipeline_sender, mut pipeline) = queued::Pipeline::new();

        // Errors travel to the caller inside the Return; they do not end the connection.
        let promise = call_promise
            .then(move |call_result| {
                results_inner_promise.then(move |results_inner| {
                    future::ready(ResultsDone::from_results_inner(
                        results_inner,
                        call_result,
                        pipeline_sender,
                    ))
                })
            })
            .map(|_| Ok::<(), Error>(()));
        let fork = Promise::from_future(promise).shared();
        pipeline.drive(fork.clone());
        let completion = connection_state.eagerly_evaluate(fork);

        if let Some(answer) = connection_state.answers.borrow_mut().slots.get_mut(&question_id) {
            answer.pipeline = Some(Box::new(pipeline));
            answer.call_completion_promise = Some(completion);
        }
        Ok(())
    }

    fn answer_has_sent_return(&self, id: AnswerId, result_exports: Vec<ExportId>) {
        let (removed, exports_to_release) = {
            let mut answers = self.answers.borrow_mut();
            let Some(answer) = answers.slots.get_mut(&id) else {
                return;
            };
            answer.return_has_been_sent = true;
            if answer.received_finish.get() {
                (answers.slots.remove(&id), result_exports)
            } else {
                answer.result_exports = result_exports;
                (None, Vec::new())
            }
        };
        drop(removed);
        if let Err(e) = self.release_exports(&exports_to_release) {
            tracing::debug!(answer_id = id, error = %e, "could not release result exports");
        }
    }

    fn release_export(&self, id: ExportId, refcount: u32) -> capwire::Result<()> {
        let removed = {
            let mut exports = self.exports.borrow_mut();
            let Some(export) = exports.find(id) else {
                return Err(Error::failed(format!(
                    "tried to release invalid export ID {id}"
                )));
            };
            if refcount > export.refcount {
                return Err(Error::failed(format!(
                    "tried to drop export's refcount below zero for export {id}"
                )));
            }
            export.refcount -= refcount;
            if export.refcount == 0 {
                let ptr = export.client_hook.get_ptr();
                self.exports_by_cap.borrow_mut().remove(&ptr);
                exports.erase(id)
            } else {
                None
            }
        };
        if removed.is_some() {
            tracing::debug!(export_id = id, "export released");
        }
        drop(removed);
        Ok(())
    }

    fn release_exports(&self, exports: &[ExportId]) -> capwire::Result<()> {
        for &export_id in exports {
            self.release_export(export_id, 1)?;
        }
        Ok(())
    }

    fn get_brand(&self) -> usize {
        self as *const _ as usize
    }

    fn get_message_target(
        &self,
        target: message_target::Reader<'_>,
    ) -> capwire::Result<Box<dyn ClientHook>> {
        match target.which()? {
            message_target::Which::ImportedCap(export_id) => {
                match self.exports.borrow_mut().find(export_id) {
                    Some(export) => Ok(export.client_hook.add_ref()),
                    None => Err(Error::failed(format!(
                        "message target is not a current export ID {export_id}"
                    ))),
                }
            }
            message_target::Which::PromisedAnswer(promised_answer) => {
                let promised_answer = promised_answer?;
                let question_id = promised_answer.get_question_id();
                let pipeline = match self.answers.borrow().slots.get(&question_id) {
                    None => {
                        return Err(Error::failed(format!(
                            "PromisedAnswer.questionId {question_id} is not a current question"
                        )));
                    }
                    Some(answer) => match &answer.pipeline {
                        Some(pipeline) => pipeline.add_ref(),
                        None => {
                            return Err(Error::failed(
                                "pipeline call on a request that returned no capabilities or \
                                 was already closed"
                                    .into(),
                            ));
                        }
                    },
                };
                let ops = to_pipeline_ops(promised_answer.get_transform()?)?;
                Ok(pipeline.get_pipelined_cap(&ops))
            }
        }
    }

    /// Writes the target of a call on `cap`. Returns a replacement when `cap` does not belong
    /// to this connection, in which case the call should go there instead.
    fn write_target(
        &self,
        cap: &dyn ClientHook,
        target: message_target::Builder<'_>,
    ) -> capwire::Result<Option<Box<dyn ClientHook>>> {
        if cap.get_brand() == self.get_brand() {
            match Client::from_ptr(cap.get_ptr(), self) {
                Some(c) => c.write_target(target),
                None => Err(Error::failed(
                    "capability of this connection is no longer registered".into(),
                )),
            }
        } else {
            Ok(Some(cap.add_ref()))
        }
    }

    fn get_innermost_client(&self, client_ref: &dyn ClientHook) -> Box<dyn ClientHook> {
        let mut client = client_ref.add_ref();
        while let Some(inner) = client.get_resolved() {
            client = inner;
        }
        if client.get_brand() == self.get_brand() {
            if let Some(c) = Client::from_ptr(client.get_ptr(), self) {
                return Box::new(c);
            }
        }
        client
    }

    /// Sends a `Resolve` once the exported promise `export_id` settles.
    fn resolve_exported_promise(
        state: &Rc<Self>,
        export_id: ExportId,
        promise: Promise<Box<dyn ClientHook>, Error>,
    ) -> Promise<(), Error> {
        let weak_state = Rc::downgrade(state);
        state.eagerly_evaluate(promise.map(move |resolution_result| {
            let Some(state) = weak_state.upgrade() else {
                return Err(Error::disconnected("connection is gone".into()));
            };
            let mut message = state.new_outgoing_message(15)?;
            let mut resolve = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_resolve()?;
            resolve.set_promise_id(export_id);

            match resolution_result {
                Ok(resolution) => {
                    let resolution = state.get_innermost_client(&*resolution);
                    let old_hook = {
                        let mut exports = state.exports.borrow_mut();
                        let Some(export) = exports.find(export_id) else {
                            return Err(Error::failed("export table entry not found".into()));
                        };
                        state
                            .exports_by_cap
                            .borrow_mut()
                            .remove(&export.client_hook.get_ptr());
                        mem::replace(&mut export.client_hook, resolution.clone())
                    };
                    drop(old_hook);
                    Self::write_descriptor(&state, &*resolution, resolve.init_cap()?)?;
                }
                Err(e) => from_error(&e, resolve.init_exception()?)?,
            }
            tracing::debug!(export_id, "exported promise resolved");
            let _ = send_outgoing(message, "resolve");
            Ok(())
        }))
    }

    fn write_descriptor(
        state: &Rc<Self>,
        cap: &dyn ClientHook,
        mut descriptor: cap_descriptor::Builder<'_>,
    ) -> capwire::Result<Option<ExportId>> {
        let mut inner = cap.add_ref();
        while let Some(resolved) = inner.get_resolved() {
            inner = resolved;
        }
        if inner.get_brand() == state.get_brand() {
            return match Client::from_ptr(inner.get_ptr(), state) {
                Some(c) => c.write_descriptor(descriptor),
                None => Err(Error::failed(
                    "capability of this connection is no longer registered".into(),
                )),
            };
        }

        let ptr = inner.get_ptr();
        let existing = state.exports_by_cap.borrow().get(&ptr).copied();
        if let Some(export_id) = existing {
            if let Some(export) = state.exports.borrow_mut().find(export_id) {
                export.refcount += 1;
                if export.resolve_op.is_some() {
                    descriptor.set_sender_promise(export_id);
                } else {
                    descriptor.set_sender_hosted(export_id);
                }
                return Ok(Some(export_id));
            }
        }

        let export_id = state.exports.borrow_mut().push(Export::new(inner.clone()));
        state.exports_by_cap.borrow_mut().insert(ptr, export_id);
        match inner.when_more_resolved() {
            Some(wrapped) => {
                let resolve_op = Self::resolve_exported_promise(state, export_id, wrapped);
                if let Some(export) = state.exports.borrow_mut().find(export_id) {
                    export.resolve_op = Some(resolve_op);
                }
                descriptor.set_sender_promise(export_id);
            }
            None => descriptor.set_sender_hosted(export_id),
        }
        tracing::debug!(export_id, "capability exported");
        Ok(Some(export_id))
    }

    /// Fills in the cap table of `payload` from `cap_table`, keeping indices.
    fn write_descriptors(
        state: &Rc<Self>,
        cap_table: &[Option<Box<dyn ClientHook>>],
        payload: payload::Builder<'_>,
    ) -> capwire::Result<Vec<ExportId>> {
        let mut cap_table_builder = payload.init_cap_table(cap_table.len() as u32)?;
        let mut exports = Vec::new();
        for (idx, cap) in cap_table.iter().enumerate() {
            let mut descriptor = cap_table_builder.reborrow().get(idx as u32);
            match cap {
                Some(cap) => {
                    if let Some(export_id) = Self::write_descriptor(state, &**cap, descriptor)? {
                        exports.push(export_id);
                    }
                }
                None => descriptor.set_none(),
            }
        }
        Ok(exports)
    }

    fn import(state: &Rc<Self>, import_id: ImportId, is_promise: bool) -> Box<dyn ClientHook> {
        let existing = state
            .imports
            .borrow()
            .slots
            .get(&import_id)
            .and_then(|import| import.import_client.as_ref())
            .and_then(|(weak, _)| weak.upgrade());
        let import_client = match existing {
            Some(import_client) => import_client,
            None => {
                let import_client = ImportClient::new(state, import_id);
                let ptr = import_client.as_ptr() as usize;
                state
                    .imports
                    .borrow_mut()
                    .slots
                    .entry(import_id)
                    .or_insert_with(Import::new)
                    .import_client = Some((Rc::downgrade(&import_client), ptr));
                tracing::debug!(import_id, is_promise, "capability imported");
                import_client
            }
        };

        // Every descriptor naming this id holds one remote reference.
        import_client.borrow_mut().add_remote_ref();

        if is_promise {
            let existing_app_client = state
                .imports
                .borrow()
                .slots
                .get(&import_id)
                .and_then(|import| import.app_client.as_ref())
                .and_then(WeakClient::upgrade);
            if let Some(c) = existing_app_client {
                return Box::new(c);
            }

            let promise_client = PromiseClient::new(
                state,
                Box::new(Client::new(state, ClientVariant::Import(import_client))),
                Some(import_id),
            );
            let client = Client::new(state, ClientVariant::Promise(promise_client.clone()));
            if let Some(import) = state.imports.borrow_mut().slots.get_mut(&import_id) {
                import.promise_client_to_resolve = Some(Rc::downgrade(&promise_client));
                import.app_client = Some(client.downgrade());
            }
            Box::new(client)
        } else {
            let client = Client::new(state, ClientVariant::Import(import_client));
            if let Some(import) = state.imports.borrow_mut().slots.get_mut(&import_id) {
                import.app_client = Some(client.downgrade());
            }
            Box::new(client)
        }
    }

    fn receive_cap(
        state: &Rc<Self>,
        descriptor: cap_descriptor::Reader<'_>,
    ) -> capwire::Result<Option<Box<dyn ClientHook>>> {
        match descriptor.which()? {
            cap_descriptor::Which::None => Ok(None),
            cap_descriptor::Which::SenderHosted(sender_hosted) => {
                Ok(Some(Self::import(state, sender_hosted, false)))
            }
            cap_descriptor::Which::SenderPromise(sender_promise) => {
                Ok(Some(Self::import(state, sender_promise, true)))
            }
            cap_descriptor::Which::ReceiverHosted(receiver_hosted) => {
                match state.exports.borrow_mut().find(receiver_hosted) {
                    Some(export) => Ok(Some(export.client_hook.add_ref())),
                    None => Ok(Some(broken::new_cap(Error::failed(
                        "invalid 'receiverHosted' export ID".into(),
                    )))),
                }
            }
            cap_descriptor::Which::ReceiverAnswer(receiver_answer) => {
                let receiver_answer = receiver_answer?;
                let question_id = receiver_answer.get_question_id();
                let pipeline = state
                    .answers
                    .borrow()
                    .slots
                    .get(&question_id)
                    .filter(|answer| answer.active)
                    .and_then(|answer| answer.pipeline.as_ref().map(|p| p.add_ref()));
                match pipeline {
                    Some(pipeline) => {
                        let ops = to_pipeline_ops(receiver_answer.get_transform()?)?;
                        Ok(Some(pipeline.get_pipelined_cap(&ops)))
                    }
                    None => Ok(Some(broken::new_cap(Error::failed(
                        "invalid 'receiverAnswer'".into(),
                    )))),
                }
            }
            cap_descriptor::Which::ThirdPartyHosted => Err(Error::unimplemented(
                "ThirdPartyHosted caps are not supported".into(),
            )),
        }
    }

    fn receive_caps(
        state: &Rc<Self>,
        cap_table: struct_list::Reader<'_, cap_descriptor::Owned>,
    ) -> capwire::Result<Vec<Option<Box<dyn ClientHook>>>> {
        cap_table
            .iter()
            .map(|descriptor| Self::receive_cap(state, descriptor))
            .collect()
    }
}

struct ResponseState<VatId>
where
    VatId: 'static,
{
    _connection_state: Rc<ConnectionState<VatId>>,
    message: Box<dyn crate::IncomingMessage>,
    _question_ref: Rc<RefCell<QuestionRef<VatId>>>,
}

/// Results of a call made over the connection. Holding one keeps its question open.
pub struct Response<VatId>
where
    VatId: 'static,
{
    state: Rc<ResponseState<VatId>>,
}

impl<VatId> Response<VatId> {
    fn new(
        connection_state: Rc<ConnectionState<VatId>>,
        question_ref: Rc<RefCell<QuestionRef<VatId>>>,
        message: Box<dyn crate::IncomingMessage>,
    ) -> Self {
        Self {
            state: Rc::new(ResponseState {
                _connection_state: connection_state,
                message,
                _question_ref: question_ref,
            }),
        }
    }
}

impl<VatId> Clone for Response<VatId> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<VatId> ResponseHook for Response<VatId> {
    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        let root: message::Reader = self.state.message.get_body()?.get_as()?;
        match root.which()? {
            message::Which::Return(ret) => match ret?.which()? {
                return_::Which::Results(results) => Ok(results?.get_content()),
                _ => Err(Error::failed("Return message does not carry results".into())),
            },
            _ => Err(Error::failed("response is not a Return message".into())),
        }
    }
}

struct Request<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    target: Client<VatId>,
    message: Box<dyn crate::OutgoingMessage>,
}

impl<VatId> Request<VatId>
where
    VatId: 'static,
{
    fn new(
        connection_state: Rc<ConnectionState<VatId>>,
        size_hint: Option<MessageSize>,
        target: Client<VatId>,
        interface_id: u64,
        method_id: u16,
    ) -> capwire::Result<Self> {
        let first_segment_words = size_hint.map_or(100, |hint| {
            (hint.word_count + 20).min(u32::MAX as u64) as u32
        });
        let mut message = connection_state.new_outgoing_message(first_segment_words)?;
        {
            let mut call = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_call()?;
            call.set_interface_id(interface_id);
            call.set_method_id(method_id);
        }
        Ok(Self {
            connection_state,
            target,
            message,
        })
    }

    fn send_internal(
        connection_state: &Rc<ConnectionState<VatId>>,
        mut message: Box<dyn crate::OutgoingMessage>,
    ) -> capwire::Result<(Rc<RefCell<QuestionRef<VatId>>>, Promise<Response<VatId>, Error>)> {
        // Checked before any export is created, so a refused call leaves no refcounts behind.
        if let Some(limit) = connection_state.max_message_words() {
            let words = message.size_in_words();
            if words > limit {
                return Err(Error::from_kind_context(
                    ErrorKind::MessageTooLarge,
                    format!("call message of {words} words exceeds the limit of {limit} words"),
                ));
            }
        }

        let cap_table = message.cap_table();
        let exports = {
            let params = get_call(&mut message)?.get_params()?;
            ConnectionState::write_descriptors(connection_state, &cap_table, params)?
        };

        let mut question = Question::new();
        question.param_exports = exports;
        let question_id = connection_state.questions.borrow_mut().push(question);
        if let Err(e) = get_call(&mut message).map(|mut call| call.set_question_id(question_id)) {
            connection_state.questions.borrow_mut().erase(question_id);
            return Err(e);
        }

        let (fulfiller, promise) = oneshot::channel();
        let promise = promise
            .map_err(crate::canceled_to_error)
            .and_then(|response| response);
        let question_ref = Rc::new(RefCell::new(QuestionRef::new(
            connection_state.clone(),
            question_id,
            fulfiller,
        )));
        if let Some(question) = connection_state.questions.borrow_mut().find(question_id) {
            question.self_ref = Some(Rc::downgrade(&question_ref));
        }

        tracing::debug!(question_id, "question sent");
        let _ = send_outgoing(message, "call");

        let held = question_ref.clone();
        let promise = promise.map(move |result| {
            drop(held);
            result
        });
        Ok((question_ref, Promise::from_future(promise)))
    }
}

impl<VatId> RequestHook for Request<VatId> {
    fn get(&mut self) -> capwire::Result<any_pointer::Builder<'_>> {
        Ok(get_call(&mut self.message)?.get_params()?.get_content())
    }

    fn get_brand(&self) -> usize {
        self.connection_state.get_brand()
    }

    fn send(self: Box<Self>) -> RemotePromise {
        let Self {
            connection_state,
            target,
            mut message,
        } = *self;

        let redirect = match get_call(&mut message)
            .and_then(|call| call.init_target())
            .and_then(|builder| target.write_target(builder))
        {
            Ok(redirect) => redirect,
            Err(e) => return broken_remote_promise(e),
        };

        match redirect {
            Some(redirect) => {
                // The target resolved to something outside this connection. Replay the call
                // there.
                let replacement = get_call(&mut message).and_then(|call| {
                    let interface_id = call.get_interface_id();
                    let method_id = call.get_method_id();
                    let mut replacement = redirect.new_call(interface_id, method_id, None);
                    replacement.set(call.get_params()?.get_content().into_reader())?;
                    Ok(replacement)
                });
                match replacement {
                    Ok(replacement) => replacement.send(),
                    Err(e) => broken_remote_promise(e),
                }
            }
            None => match Self::send_internal(&connection_state, message) {
                Err(e) => broken_remote_promise(e),
                Ok((question_ref, promise)) => {
                    let forked = promise.shared();
                    let pipeline = Pipeline::new(
                        connection_state,
                        question_ref,
                        Promise::from_future(forked.clone()),
                    );
                    // The pipeline swaps its promised caps for the real ones before the
                    // response is handed out.
                    let resolved = pipeline.when_resolved();
                    let app_promise = resolved
                        .then(move |_| forked)
                        .map_ok(|response| capability::Response::new(Box::new(response)));

                    RemotePromise {
                        promise: Promise::from_future(app_promise),
                        pipeline: any_pointer::Pipeline::new(Box::new(pipeline)),
                    }
                }
            },
        }
    }
}

enum PipelineVariant<VatId>
where
    VatId: 'static,
{
    Waiting(Rc<RefCell<QuestionRef<VatId>>>),
    Resolved(Response<VatId>),
    Broken(Error),
}

struct PipelineState<VatId>
where
    VatId: 'static,
{
    variant: PipelineVariant<VatId>,
    connection_state: Rc<ConnectionState<VatId>>,

    #[allow(dead_code)]
    resolve_self_promise: Option<Promise<(), Error>>,

    promise_clients_to_resolve:
        SenderQueue<(Weak<RefCell<PromiseClient<VatId>>>, Vec<PipelineOp>), ()>,
    resolution_waiters: SenderQueue<(), ()>,
}

impl<VatId> PipelineState<VatId>
where
    VatId: 'static,
{
    fn resolve(state: &Rc<RefCell<Self>>, response: Result<Response<VatId>, Error>) {
        let to_resolve: Vec<_> = state.borrow_mut().promise_clients_to_resolve.drain().collect();
        for ((weak_client, ops), waiter) in to_resolve {
            if let Some(client) = weak_client.upgrade() {
                let resolved = match &response {
                    Ok(response) => response.get().and_then(|r| r.get_pipelined_cap(&ops)),
                    Err(e) => Err(e.clone()),
                };
                client.borrow_mut().resolve(resolved);
            }
            let _ = waiter.send(());
        }

        let new_variant = match response {
            Ok(response) => PipelineVariant::Resolved(response),
            Err(e) => PipelineVariant::Broken(e),
        };
        let old_variant = mem::replace(&mut state.borrow_mut().variant, new_variant);

        let waiters: Vec<_> = state.borrow_mut().resolution_waiters.drain().collect();
        for ((), waiter) in waiters {
            let _ = waiter.send(());
        }
        drop(old_variant);
    }
}

struct Pipeline<VatId>
where
    VatId: 'static,
{
    state: Rc<RefCell<PipelineState<VatId>>>,
}

impl<VatId> Pipeline<VatId> {
    fn new(
        connection_state: Rc<ConnectionState<VatId>>,
        question_ref: Rc<RefCell<QuestionRef<VatId>>>,
        redirect_later: Promise<Response<VatId>, Error>,
    ) -> Self {
        let state = Rc::new(RefCell::new(PipelineState {
            variant: PipelineVariant::Waiting(question_ref),
            connection_state: connection_state.clone(),
            resolve_self_promise: None,
            promise_clients_to_resolve: SenderQueue::new(),
            resolution_waiters: SenderQueue::new(),
        }));
        let this = Rc::downgrade(&state);
        let resolve_self_promise = connection_state.eagerly_evaluate(redirect_later.then(
            move |response| {
                if let Some(state) = this.upgrade() {
                    PipelineState::resolve(&state, response);
                }
                Promise::ok(())
            },
        ));
        state.borrow_mut().resolve_self_promise = Some(resolve_self_promise);
        Self { state }
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        let mut state = self.state.borrow_mut();
        match state.variant {
            PipelineVariant::Waiting(_) => state.resolution_waiters.push(()),
            _ => Promise::ok(()),
        }
    }
}

impl<VatId> PipelineHook for Pipeline<VatId> {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(Self {
            state: self.state.clone(),
        })
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        self.get_pipelined_cap_move(ops.into())
    }

    fn get_pipelined_cap_move(&self, ops: Vec<PipelineOp>) -> Box<dyn ClientHook> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        match &state.variant {
            PipelineVariant::Waiting(question_ref) => {
                let pipeline_client = PipelineClient::new(
                    &state.connection_state,
                    question_ref.clone(),
                    ops.clone(),
                    self.state.clone(),
                );
                let promise_client = PromiseClient::new(
                    &state.connection_state,
                    Box::new(Client::new(
                        &state.connection_state,
                        ClientVariant::Pipeline(pipeline_client),
                    )),
                    None,
                );
                state
                    .promise_clients_to_resolve
                    .push_detach((Rc::downgrade(&promise_client), ops));
                Box::new(Client::new(
                    &state.connection_state,
                    ClientVariant::Promise(promise_client),
                ))
            }
            PipelineVariant::Resolved(response) => response
                .get()
                .and_then(|results| results.get_pipelined_cap(&ops))
                .unwrap_or_else(broken::new_cap),
            PipelineVariant::Broken(e) => broken::new_cap(e.clone()),
        }
    }
}

pub struct Params {
    request: Box<dyn crate::IncomingMessage>,
}

impl Params {
    fn new(request: Box<dyn crate::IncomingMessage>) -> Self {
        Self { request }
    }
}

impl ParamsHook for Params {
    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        let root: message::Reader = self.request.get_body()?.get_as()?;
        match root.which()? {
            message::Which::Call(call) => Ok(call?.get_params()?.get_content()),
            _ => Err(Error::failed("params are not in a Call message".into())),
        }
    }
}

/// What the callee hands back once its handler is done with the results.
struct ResultsInner<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    message: Option<Box<dyn crate::OutgoingMessage>>,
    answer_id: AnswerId,
    finish_received: Rc<Cell<bool>>,
}

impl<VatId> ResultsInner<VatId>
where
    VatId: 'static,
{
    fn ensure_initialized(&mut self) -> capwire::Result<()> {
        if self.message.is_some() {
            return Ok(());
        }
        let mut message = self.connection_state.new_outgoing_message(100)?;
        {
            let mut ret = message
                .get_body()?
                .init_as::<message::Builder>()?
                .init_return()?;
            ret.set_answer_id(self.answer_id);
            ret.set_release_param_caps(false);
            ret.init_results()?;
        }
        self.message = Some(message);
        Ok(())
    }

    /// Sends the Return carrying the results and keeps a copy for local pipelining.
    fn send_results(&mut self) -> capwire::Result<Box<dyn ResultsDoneHook>> {
        self.ensure_initialized()?;
        let Some(mut message) = self.message.take() else {
            return Err(Error::failed("results were already sent".into()));
        };
        let cap_table = message.cap_table();
        let exports = {
            let results = get_return_results(&mut message)?;
            ConnectionState::write_descriptors(&self.connection_state, &cap_table, results)?
        };
        let (_promise, sent) = send_outgoing(message, "return");
        tracing::debug!(answer_id = self.answer_id, "answer returned");
        self.connection_state
            .answer_has_sent_return(self.answer_id, exports);
        Ok(Box::new(ResultsDone::new(sent)))
    }

    fn send_exception(&mut self, error: &Error) {
        self.message = None;
        if let Err(e) = self
            .connection_state
            .send_return_exception(self.answer_id, error)
        {
            tracing::debug!(answer_id = self.answer_id, error = %e, "could not send exception");
        }
        self.connection_state
            .answer_has_sent_return(self.answer_id, Vec::new());
    }

    /// Results for a call the caller already finished. Nothing goes on the wire; the
    /// content only feeds calls pipelined on this answer from this side.
    fn local_results(&mut self) -> capwire::Result<Box<dyn ResultsDoneHook>> {
        match self.message.take() {
            Some(message) => Ok(Box::new(ResultsDone::new(Rc::new(message.take())))),
            None => Err(Error::failed("call was canceled".into())),
        }
    }
}

struct Results<VatId>
where
    VatId: 'static,
{
    inner: Option<ResultsInner<VatId>>,
    results_done_fulfiller: Option<oneshot::Sender<ResultsInner<VatId>>>,
}

impl<VatId> Results<VatId>
where
    VatId: 'static,
{
    fn new(
        connection_state: &Rc<ConnectionState<VatId>>,
        answer_id: AnswerId,
        fulfiller: oneshot::Sender<ResultsInner<VatId>>,
        finish_received: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            inner: Some(ResultsInner {
                connection_state: connection_state.clone(),
                message: None,
                answer_id,
                finish_received,
            }),
            results_done_fulfiller: Some(fulfiller),
        }
    }
}

impl<VatId> Drop for Results<VatId> {
    fn drop(&mut self) {
        if let (Some(inner), Some(fulfiller)) =
            (self.inner.take(), self.results_done_fulfiller.take())
        {
            let _ = fulfiller.send(inner);
        }
    }
}

impl<VatId> ResultsHook for Results<VatId> {
    fn get(&mut self) -> capwire::Result<any_pointer::Builder<'_>> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::failed("results were already returned".into()));
        };
        inner.ensure_initialized()?;
        match inner.message.as_mut() {
            Some(message) => Ok(get_return_results(message)?.get_content()),
            None => Err(Error::failed("results were already returned".into())),
        }
    }
}

struct ResultsDone {
    message: Rc<MessageBuilder>,
}

impl ResultsDone {
    fn new(message: Rc<MessageBuilder>) -> Self {
        Self { message }
    }

    fn from_results_inner<VatId>(
        results_inner: Result<ResultsInner<VatId>, Error>,
        call_status: Result<(), Error>,
        pipeline_sender: queued::PipelineInnerSender,
    ) -> Result<Box<dyn ResultsDoneHook>, Error> {
        let mut results_inner = match results_inner {
            Ok(inner) => inner,
            Err(e) => {
                pipeline_sender.reject(e.clone());
                return Err(e);
            }
        };

        let outcome = if results_inner.finish_received.get() {
            // The Return went out when the Finish arrived.
            call_status.and_then(|()| results_inner.local_results())
        } else {
            match call_status.and_then(|()| results_inner.send_results()) {
                Ok(hook) => Ok(hook),
                Err(e) => {
                    results_inner.send_exception(&e);
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(hook) => {
                pipeline_sender.complete(Box::new(local::Pipeline::new(hook.clone())));
                Ok(hook)
            }
            Err(e) => {
                pipeline_sender.reject(e.clone());
                Err(e)
            }
        }
    }
}

impl ResultsDoneHook for ResultsDone {
    fn add_ref(&self) -> Box<dyn ResultsDoneHook> {
        Box::new(Self {
            message: self.message.clone(),
        })
    }

    fn get(&self) -> capwire::Result<any_pointer::Reader<'_>> {
        let root: message::Reader = self.message.get_root_as_reader()?;
        match root.which()? {
            message::Which::Return(ret) => match ret?.which()? {
                return_::Which::Results(results) => Ok(results?.get_content()),
                _ => Err(Error::failed("Return message does not carry results".into())),
            },
            _ => Err(Error::failed("results are not in a Return message".into())),
        }
    }
}

enum ClientVariant<VatId>
where
    VatId: 'static,
{
    Import(Rc<RefCell<ImportClient<VatId>>>),
    Pipeline(Rc<RefCell<PipelineClient<VatId>>>),
    Promise(Rc<RefCell<PromiseClient<VatId>>>),
}

impl<VatId> ClientVariant<VatId> {
    fn downgrade(&self) -> WeakClientVariant<VatId> {
        match self {
            Self::Import(c) => WeakClientVariant::Import(Rc::downgrade(c)),
            Self::Pipeline(c) => WeakClientVariant::Pipeline(Rc::downgrade(c)),
            Self::Promise(c) => WeakClientVariant::Promise(Rc::downgrade(c)),
        }
    }

    fn get_ptr(&self) -> usize {
        match self {
            Self::Import(c) => c.as_ptr() as usize,
            Self::Pipeline(c) => c.as_ptr() as usize,
            Self::Promise(c) => c.as_ptr() as usize,
        }
    }
}

impl<VatId> Clone for ClientVariant<VatId> {
    fn clone(&self) -> Self {
        match self {
            Self::Import(c) => Self::Import(c.clone()),
            Self::Pipeline(c) => Self::Pipeline(c.clone()),
            Self::Promise(c) => Self::Promise(c.clone()),
        }
    }
}

/// A capability whose calls go out over this connection.
struct Client<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    variant: ClientVariant<VatId>,
}

enum WeakClientVariant<VatId>
where
    VatId: 'static,
{
    Import(Weak<RefCell<ImportClient<VatId>>>),
    Pipeline(Weak<RefCell<PipelineClient<VatId>>>),
    Promise(Weak<RefCell<PromiseClient<VatId>>>),
}

pub struct WeakClient<VatId>
where
    VatId: 'static,
{
    connection_state: Weak<ConnectionState<VatId>>,
    variant: WeakClientVariant<VatId>,
    ptr: usize,
}

impl<VatId> WeakClient<VatId> {
    fn upgrade(&self) -> Option<Client<VatId>> {
        let connection_state = self.connection_state.upgrade()?;
        let variant = match &self.variant {
            WeakClientVariant::Import(c) => ClientVariant::Import(c.upgrade()?),
            WeakClientVariant::Pipeline(c) => ClientVariant::Pipeline(c.upgrade()?),
            WeakClientVariant::Promise(c) => ClientVariant::Promise(c.upgrade()?),
        };
        Some(Client {
            connection_state,
            variant,
        })
    }
}

impl<VatId> Client<VatId> {
    fn new(connection_state: &Rc<ConnectionState<VatId>>, variant: ClientVariant<VatId>) -> Self {
        let client = Self {
            connection_state: connection_state.clone(),
            variant,
        };
        connection_state
            .client_downcast_map
            .borrow_mut()
            .insert(client.get_ptr(), client.downgrade());
        client
    }

    fn downgrade(&self) -> WeakClient<VatId> {
        WeakClient {
            connection_state: Rc::downgrade(&self.connection_state),
            variant: self.variant.downgrade(),
            ptr: self.variant.get_ptr(),
        }
    }

    fn from_ptr(ptr: usize, state: &ConnectionState<VatId>) -> Option<Self> {
        state
            .client_downcast_map
            .borrow()
            .get(&ptr)
            .and_then(WeakClient::upgrade)
    }

    fn write_target(
        &self,
        mut target: message_target::Builder<'_>,
    ) -> capwire::Result<Option<Box<dyn ClientHook>>> {
        match &self.variant {
            ClientVariant::Import(import_client) => {
                target.set_imported_cap(import_client.borrow().import_id);
                Ok(None)
            }
            ClientVariant::Pipeline(pipeline_client) => {
                let pipeline_client = pipeline_client.borrow();
                let mut builder = target.init_promised_answer()?;
                builder.set_question_id(pipeline_client.question_ref.borrow().id);
                write_pipeline_ops(&pipeline_client.ops, builder)?;
                Ok(None)
            }
            ClientVariant::Promise(promise_client) => {
                promise_client.borrow_mut().received_call = true;
                let cap = promise_client.borrow().cap.add_ref();
                self.connection_state.write_target(&*cap, target)
            }
        }
    }

    fn write_descriptor(
        &self,
        mut descriptor: cap_descriptor::Builder<'_>,
    ) -> capwire::Result<Option<ExportId>> {
        match &self.variant {
            ClientVariant::Import(import_client) => {
                descriptor.set_receiver_hosted(import_client.borrow().import_id);
                Ok(None)
            }
            ClientVariant::Pipeline(pipeline_client) => {
                let pipeline_client = pipeline_client.borrow();
                let mut promised_answer = descriptor.init_receiver_answer()?;
                promised_answer.set_question_id(pipeline_client.question_ref.borrow().id);
                write_pipeline_ops(&pipeline_client.ops, promised_answer)?;
                Ok(None)
            }
            ClientVariant::Promise(promise_client) => {
                promise_client.borrow_mut().received_call = true;
                let cap = promise_client.borrow().cap.add_ref();
                ConnectionState::write_descriptor(&self.connection_state, &*cap, descriptor)
            }
        }
    }
}

impl<VatId> Clone for Client<VatId> {
    fn clone(&self) -> Self {
        Self {
            connection_state: self.connection_state.clone(),
            variant: self.variant.clone(),
        }
    }
}

impl<VatId> ClientHook for Client<VatId> {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn new_call(
        &self,
        interface_id: u64,
        method_id: u16,
        size_hint: Option<MessageSize>,
    ) -> capability::Request {
        let request: Box<dyn RequestHook> = match Request::new(
            self.connection_state.clone(),
            size_hint,
            self.clone(),
            interface_id,
            method_id,
        ) {
            Ok(request) => Box::new(request),
            Err(e) => Box::new(broken::Request::new(e, None)),
        };
        capability::Request::new(request)
    }

    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Box<dyn ParamsHook>,
        mut results: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        let request = params.get().and_then(|params| {
            let mut request = self.new_call(interface_id, method_id, Some(params.target_size()?));
            request.set(params)?;
            Ok(request)
        });
        let request = capwire::pry!(request);
        Promise::from_future(request.send().promise.and_then(move |response| {
            capwire::pry!(capwire::pry!(results.get()).set_as(capwire::pry!(response.get())));
            Promise::ok(())
        }))
    }

    fn get_ptr(&self) -> usize {
        self.variant.get_ptr()
    }

    fn get_brand(&self) -> usize {
        self.connection_state.get_brand()
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        match &self.variant {
            ClientVariant::Import(_) | ClientVariant::Pipeline(_) => None,
            ClientVariant::Promise(promise_client) => {
                let promise_client = promise_client.borrow();
                promise_client
                    .is_resolved
                    .then(|| promise_client.cap.add_ref())
            }
        }
    }

    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        match &self.variant {
            ClientVariant::Import(_) | ClientVariant::Pipeline(_) => None,
            ClientVariant::Promise(promise_client) => {
                let mut promise_client = promise_client.borrow_mut();
                if promise_client.is_resolved {
                    Some(Promise::ok(promise_client.cap.add_ref()))
                } else {
                    Some(promise_client.resolution_waiters.push(()))
                }
            }
        }
    }

    fn when_resolved(&self) -> Promise<(), Error> {
        default_when_resolved_impl(self)
    }
}

pub(crate) fn default_when_resolved_impl<C>(client: &C) -> Promise<(), Error>
where
    C: ClientHook + ?Sized,
{
    match client.when_more_resolved() {
        Some(promise) => {
            Promise::from_future(promise.and_then(|resolution| resolution.when_resolved()))
        }
        None => Promise::ok(()),
    }
}

/// A capability the peer exported to us.
struct ImportClient<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    import_id: ImportId,

    /// How many descriptors naming this import we have received. Sent back in `Release`.
    remote_ref_count: u32,
}

impl<VatId> ImportClient<VatId> {
    fn new(
        connection_state: &Rc<ConnectionState<VatId>>,
        import_id: ImportId,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            connection_state: connection_state.clone(),
            import_id,
            remote_ref_count: 0,
        }))
    }

    fn add_remote_ref(&mut self) {
        self.remote_ref_count += 1;
    }
}

impl<VatId> Drop for ImportClient<VatId> {
    fn drop(&mut self) {
        let self_ptr = self as *const Self as usize;
        let state = &self.connection_state;
        state.client_downcast_map.borrow_mut().remove(&self_ptr);

        let removed = {
            let mut imports = state.imports.borrow_mut();
            let points_here = imports
                .slots
                .get(&self.import_id)
                .and_then(|import| import.import_client.as_ref())
                .is_some_and(|(_, ptr)| *ptr == self_ptr);
            if points_here {
                imports.slots.remove(&self.import_id)
            } else {
                None
            }
        };
        drop(removed);

        if self.remote_ref_count > 0 && state.connection.borrow().is_ok() {
            tracing::debug!(
                import_id = self.import_id,
                count = self.remote_ref_count,
                "releasing import"
            );
            if let Err(e) = state.send_release(self.import_id, self.remote_ref_count) {
                tracing::debug!(import_id = self.import_id, error = %e, "could not send release");
            }
        }
    }
}

/// A capability expected in the results of a question that has not returned yet.
struct PipelineClient<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    question_ref: Rc<RefCell<QuestionRef<VatId>>>,
    ops: Vec<PipelineOp>,

    // Keeps the pipeline resolving after the caller drops it, so that the promise client
    // wrapping this one still learns where the capability ended up.
    _pipeline_state: Rc<RefCell<PipelineState<VatId>>>,
}

impl<VatId> PipelineClient<VatId> {
    fn new(
        connection_state: &Rc<ConnectionState<VatId>>,
        question_ref: Rc<RefCell<QuestionRef<VatId>>>,
        ops: Vec<PipelineOp>,
        pipeline_state: Rc<RefCell<PipelineState<VatId>>>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            connection_state: connection_state.clone(),
            question_ref,
            ops,
            _pipeline_state: pipeline_state,
        }))
    }
}

impl<VatId> Drop for PipelineClient<VatId> {
    fn drop(&mut self) {
        let self_ptr = self as *const Self as usize;
        self.connection_state
            .client_downcast_map
            .borrow_mut()
            .remove(&self_ptr);
    }
}

/// A client that starts out pointing at a promise and later switches to what it resolved to.
struct PromiseClient<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<ConnectionState<VatId>>,
    is_resolved: bool,
    cap: Box<dyn ClientHook>,
    import_id: Option<ImportId>,
    received_call: bool,
    resolution_waiters: SenderQueue<(), Box<dyn ClientHook>>,
}

impl<VatId> PromiseClient<VatId> {
    fn new(
        connection_state: &Rc<ConnectionState<VatId>>,
        initial: Box<dyn ClientHook>,
        import_id: Option<ImportId>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            connection_state: connection_state.clone(),
            is_resolved: false,
            cap: initial,
            import_id,
            received_call: false,
            resolution_waiters: SenderQueue::new(),
        }))
    }

    fn resolve(&mut self, replacement: Result<Box<dyn ClientHook>, Error>) {
        if self.is_resolved {
            return;
        }
        let (mut replacement, is_error) = match replacement {
            Ok(v) => (v, false),
            Err(e) => (broken::new_cap(e), true),
        };
        let connection_state = self.connection_state.clone();
        let is_connected = connection_state.connection.borrow().is_ok();

        if replacement.get_brand() != connection_state.get_brand()
            && self.received_call
            && !is_error
            && is_connected
        {
            // Calls already sent toward the promise may still be in flight to the peer and will
            // loop back. New calls wait until the Disembargo has made the round trip so they
            // cannot overtake them.
            replacement = self.embargo(&connection_state, replacement);
        }

        let waiters: Vec<_> = self.resolution_waiters.drain().collect();
        for ((), waiter) in waiters {
            let _ = waiter.send(replacement.clone());
        }

        let old_cap = mem::replace(&mut self.cap, replacement);
        connection_state.add_task(async move {
            drop(old_cap);
            Ok(())
        });

        self.is_resolved = true;
    }

    fn embargo(
        &self,
        connection_state: &Rc<ConnectionState<VatId>>,
        replacement: Box<dyn ClientHook>,
    ) -> Box<dyn ClientHook> {
        let (fulfiller, promise) = oneshot::channel::<Result<(), Error>>();
        let embargo_id = connection_state
            .embargoes
            .borrow_mut()
            .push(Embargo::new(fulfiller));
        if let Err(e) = connection_state.send_disembargo_loopback(embargo_id, &*self.cap) {
            tracing::debug!(embargo_id, error = %e, "could not start embargo");
            connection_state.embargoes.borrow_mut().erase(embargo_id);
            return replacement;
        }
        tracing::debug!(embargo_id, "embargo started");

        let embargo_promise = promise
            .map_err(crate::canceled_to_error)
            .and_then(future::ready)
            .map_ok(move |()| replacement);
        let mut queued_client = queued::Client::new(None);
        let weak_queued = Rc::downgrade(&queued_client.inner);
        queued_client.drive(embargo_promise.map(move |result| {
            if let Some(queued_inner) = weak_queued.upgrade() {
                queued::ClientInner::resolve(&queued_inner, result);
            }
            Ok(())
        }));
        Box::new(queued_client)
    }
}

impl<VatId> Drop for PromiseClient<VatId> {
    fn drop(&mut self) {
        let self_ptr = self as *const Self as usize;
        let state = &self.connection_state;
        if let Some(import_id) = self.import_id {
            // A later import of the same id must not find this client.
            if let Some(import) = state.imports.borrow_mut().slots.get_mut(&import_id) {
                if import
                    .app_client
                    .as_ref()
                    .is_some_and(|weak| weak.ptr == self_ptr)
                {
                    import.app_client = None;
                }
            }
        }
        state.client_downcast_map.borrow_mut().remove(&self_ptr);
    }
}

/// The pipeline of an answer whose results hold exactly one capability, at the root.
struct SingleCapPipeline {
    cap: Box<dyn ClientHook>,
}

impl SingleCapPipeline {
    fn new(cap: Box<dyn ClientHook>) -> Self {
        Self { cap }
    }
}

impl PipelineHook for SingleCapPipeline {
    fn add_ref(&self) -> Box<dyn PipelineHook> {
        Box::new(Self {
            cap: self.cap.clone(),
        })
    }

    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        if ops.iter().all(|op| matches!(op, PipelineOp::Noop)) {
            self.cap.clone()
        } else {
            broken::new_cap(Error::failed("invalid pipeline transform".into()))
        }
    }
}

enum DisconnectorState {
    New,
    Disconnecting,
    Disconnected,
}

/// Future that, when polled, disconnects the connection and completes once the shutdown is
/// done.
#[must_use = "futures do nothing unless polled"]
pub struct Disconnector<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<RefCell<Option<Rc<ConnectionState<VatId>>>>>,
    state: DisconnectorState,
}

impl<VatId> Disconnector<VatId> {
    pub fn new(connection_state: Rc<RefCell<Option<Rc<ConnectionState<VatId>>>>>) -> Self {
        Self {
            connection_state,
            state: DisconnectorState::New,
        }
    }

    fn disconnect(&self) {
        if let Some(state) = self.connection_state.borrow().as_ref() {
            state.disconnect(Error::disconnected("client requested disconnect".into()));
        }
    }
}

impl<VatId> Future for Disconnector<VatId>
where
    VatId: 'static,
{
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.state = match self.state {
            DisconnectorState::New => {
                self.disconnect();
                DisconnectorState::Disconnecting
            }
            DisconnectorState::Disconnecting => {
                if self.connection_state.borrow().is_some() {
                    DisconnectorState::Disconnecting
                } else {
                    DisconnectorState::Disconnected
                }
            }
            DisconnectorState::Disconnected => DisconnectorState::Disconnected,
        };
        match self.state {
            DisconnectorState::New | DisconnectorState::Disconnecting => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            DisconnectorState::Disconnected => Poll::Ready(Ok(())),
        }
    }
}

/// Observes the connection of an `RpcSystem`, including after the system has been spawned.
pub struct ConnectionMonitor<VatId>
where
    VatId: 'static,
{
    connection_state: Rc<RefCell<Option<Rc<ConnectionState<VatId>>>>>,
}

impl<VatId> Clone for ConnectionMonitor<VatId> {
    fn clone(&self) -> Self {
        Self {
            connection_state: self.connection_state.clone(),
        }
    }
}

impl<VatId> ConnectionMonitor<VatId> {
    pub fn new(connection_state: Rc<RefCell<Option<Rc<ConnectionState<VatId>>>>>) -> Self {
        Self { connection_state }
    }

    pub fn phase(&self) -> Option<ConnectionPhase> {
        self.connection_state.borrow().as_ref().map(|state| state.phase())
    }

    /// `None` while there is no connection.
    pub fn table_sizes(&self) -> Option<TableSizes> {
        self.connection_state
            .borrow()
            .as_ref()
            .map(|state| state.table_sizes())
    }
}

#[cfg(test)]
mod test {
    use super::ExportTable;

    #[test]
    fn export_ids_are_reused_smallest_first() {
        let mut table = ExportTable::new();
        assert_eq!(table.push("a"), 0);
        assert_eq!(table.push("b"), 1);
        assert_eq!(table.push("c"), 2);
        assert_eq!(table.erase(2), Some("c"));
        assert_eq!(table.erase(0), Some("a"));
        assert_eq!(table.erase(0), None);
        assert_eq!(table.push("d"), 0);
        assert_eq!(table.push("e"), 2);
        assert_eq!(table.push("f"), 3);
        assert_eq!(table.iter().count(), 4);
    }

    #[test]
    fn take_all_empties_the_table() {
        let mut table = ExportTable::new();
        table.push(1u8);
        table.push(2u8);
        table.erase(0);
        assert_eq!(table.take_all(), vec![2u8]);
        assert_eq!(table.push(3u8), 0);
    }
}
