// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The gateway service: context pool, listener, worker threads, and the
//! channel-lifecycle operations the RTS layer drives.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use openssl::ssl::SslContext;

use crate::auth::{AuthBackend, OpenGuard, UserGuard};
use crate::channel::ChannelState;
use crate::config::GatewayConfig;
use crate::connection::Connection;
use crate::context::{ChannelRef, HttpContext, SchedState};
use crate::debug::{DebugControl, DebugOptions};
use crate::delegate::{ContentHandler, DelegationDispatcher};
use crate::error::GatewayError;
use crate::pdu::{ChannelBinding, ChannelGate, ChannelKind, Pdu, PduEngine};
use crate::readiness::PollReadiness;
use crate::request::UriRewriter;
use crate::scheduler::{Scheduler, Verdict};
use crate::stream::ChunkPool;
use crate::tls::build_tls_context;
use crate::vconn::{CreateOutcome, InSlot, OutSlot, SlotId, VconnRegistry};

/// Stream chunks each context may hold before the pool refuses more.
const CHUNKS_PER_CONTEXT: usize = 64;

pub struct GatewayService {
    config: GatewayConfig,
    tls: Option<SslContext>,
    pool: Arc<ChunkPool>,
    contexts: Vec<Mutex<HttpContext>>,
    free_slots: Mutex<Vec<SlotId>>,
    registry: Arc<VconnRegistry>,
    sched: Arc<Scheduler>,
    pub(crate) debug: DebugControl,
    engine: Arc<dyn PduEngine>,
    auth: Arc<dyn AuthBackend>,
    guard: Arc<dyn UserGuard>,
    dispatcher: DelegationDispatcher,
    rewriter: Option<Box<dyn UriRewriter>>,
    async_stop: AtomicBool,
}

/// Wires the collaborators together.
pub struct GatewayBuilder {
    config: GatewayConfig,
    engine: Option<Arc<dyn PduEngine>>,
    auth: Option<Arc<dyn AuthBackend>>,
    guard: Arc<dyn UserGuard>,
    dispatcher: DelegationDispatcher,
    rewriter: Option<Box<dyn UriRewriter>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            engine: None,
            auth: None,
            guard: Arc::new(OpenGuard),
            dispatcher: DelegationDispatcher::new(),
            rewriter: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn PduEngine>) -> GatewayBuilder {
        self.engine = Some(engine);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthBackend>) -> GatewayBuilder {
        self.auth = Some(auth);
        self
    }

    pub fn user_guard(mut self, guard: Arc<dyn UserGuard>) -> GatewayBuilder {
        self.guard = guard;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ContentHandler>) -> GatewayBuilder {
        self.dispatcher = self.dispatcher.add(handler);
        self
    }

    pub fn rewriter(mut self, rewriter: Box<dyn UriRewriter>) -> GatewayBuilder {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn build(self) -> Result<Arc<GatewayService>, GatewayError> {
        let config = self.config;
        if config.context_num == 0 {
            return Err(GatewayError::Config("context_num must be positive".into()));
        }
        let engine = self
            .engine
            .ok_or_else(|| GatewayError::Config("a PDU engine is required".into()))?;
        let auth = self
            .auth
            .ok_or_else(|| GatewayError::Config("an auth backend is required".into()))?;
        let tls = if config.http_support_tls {
            Some(build_tls_context(&config)?)
        } else {
            None
        };
        let debug = DebugControl::new(
            config
                .ews_debug
                .as_deref()
                .map(DebugOptions::parse)
                .unwrap_or_default(),
            config.http_debug,
            config.request_logging,
            config.response_logging,
        );
        let pool = ChunkPool::new(config.context_num * CHUNKS_PER_CONTEXT);
        let contexts = (0..config.context_num)
            .map(|slot| Mutex::new(HttpContext::new(slot, pool.clone())))
            .collect();
        let free_slots = (0..config.context_num).rev().collect();
        let readiness = Arc::new(PollReadiness::new()?);
        let sched = Scheduler::new(config.context_num, readiness);
        let registry = VconnRegistry::new(config.context_num + 1);
        Ok(Arc::new(GatewayService {
            config,
            tls,
            pool,
            contexts,
            free_slots: Mutex::new(free_slots),
            registry,
            sched,
            debug,
            engine,
            auth,
            guard: self.guard,
            dispatcher: self.dispatcher,
            rewriter: self.rewriter,
            async_stop: AtomicBool::new(false),
        }))
    }
}

// Accessors used by the state machine.
impl GatewayService {
    pub(crate) fn registry(&self) -> &Arc<VconnRegistry> {
        &self.registry
    }

    pub(crate) fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub(crate) fn engine(&self) -> &dyn PduEngine {
        &*self.engine
    }

    pub(crate) fn dispatcher(&self) -> &DelegationDispatcher {
        &self.dispatcher
    }

    pub(crate) fn rewriter(&self) -> Option<&dyn UriRewriter> {
        self.rewriter.as_deref()
    }

    pub(crate) fn tls_context(&self) -> Option<&SslContext> {
        self.tls.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub(crate) fn max_auth_times(&self) -> u32 {
        self.config.max_auth_times
    }

    pub(crate) fn block_duration(&self) -> Duration {
        self.config.block_duration()
    }

    pub(crate) fn default_lang(&self) -> Option<&str> {
        self.config.user_default_lang.as_deref()
    }

    pub(crate) fn auth_backend(&self) -> &dyn AuthBackend {
        &*self.auth
    }

    pub(crate) fn user_guard(&self) -> &dyn UserGuard {
        &*self.guard
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The shared stream allocator, for handlers that stage their own
    /// buffers.
    pub fn chunk_pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }
}

impl GatewayService {
    /// Starts the accept, worker, and poller threads.
    pub fn run(self: &Arc<Self>) -> Result<RunningGateway, GatewayError> {
        let listener = TcpListener::bind(self.config.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, tls = self.tls.is_some(), "gateway listening");

        let mut handles = Vec::new();
        {
            let svc = self.clone();
            handles.push(std::thread::spawn(move || svc.accept_loop(listener)));
        }
        {
            let svc = self.clone();
            handles.push(std::thread::spawn(move || svc.sched.poll_loop()));
        }
        for _ in 0..self.config.worker_num.max(1) {
            let svc = self.clone();
            handles.push(std::thread::spawn(move || svc.worker_loop()));
        }
        Ok(RunningGateway {
            svc: self.clone(),
            handles,
            local_addr,
        })
    }

    fn accept_loop(&self, listener: TcpListener) {
        let fd = listener.as_raw_fd();
        loop {
            if self.sched.is_shutdown() {
                break;
            }
            let mut fds = [PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            )];
            let _ = poll(&mut fds, PollTimeout::from(100u16));
            if self.sched.is_shutdown() {
                break;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted");
                        self.adopt(stream);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!("accept: {e}");
                        break;
                    }
                }
            }
        }
    }

    fn adopt(&self, stream: TcpStream) {
        let Some(slot) = self.free_slots.lock().unwrap().pop() else {
            tracing::warn!("context pool exhausted, dropping connection");
            return;
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!("set_nonblocking: {e}");
            self.free_slots.lock().unwrap().push(slot);
            return;
        }
        {
            let mut ctx = self.contexts[slot].lock().unwrap();
            ctx.clear();
            ctx.connection = Connection::open(stream);
            ctx.sched_state = if self.tls.is_some() {
                SchedState::InitTls
            } else {
                SchedState::RdHead
            };
        }
        self.sched.enqueue(slot);
    }

    fn worker_loop(&self) {
        while let Some(slot) = self.sched.next() {
            self.process(slot);
        }
    }

    pub(crate) fn process(&self, slot: SlotId) {
        let _serial = self.debug.dispatch_guard();
        self.debug.throttle();
        let mut ctx = self.contexts[slot].lock().unwrap();
        let verdict = self.step(&mut ctx);
        let fd = ctx.connection.raw_fd();
        drop(ctx);
        match verdict {
            Verdict::Close => {
                self.free_slots.lock().unwrap().push(slot);
            }
            v => {
                let deadline = Instant::now() + self.timeout();
                self.sched.route(slot, v, fd, deadline);
            }
        }
    }

    /// Flags async producers to stand down before shutdown.
    pub fn shutdown_async(&self) {
        self.async_stop.store(true, Ordering::Release);
    }

    /// Queues reply PDUs produced outside the request path (notifications)
    /// onto the right channel of the tunnel named by the cookie.
    pub fn vconnection_async_reply(
        &self,
        host: &str,
        port: u16,
        connection_cookie: &str,
        pdus: Vec<Pdu>,
    ) {
        if self.async_stop.load(Ordering::Acquire) {
            tracing::debug!("noticed async_stop");
            return;
        }
        let Some(vr) = self.registry.get(host, port, connection_cookie) else {
            return;
        };
        let st = vr.lock();
        let Some((out_arc, out_slot)) = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot))
        else {
            return;
        };
        let mut och = out_arc.lock().unwrap();
        if och.obsolete {
            drop(och);
            if let Some(in_arc) = st.ctx_in.as_ref().map(|i| i.channel.clone()) {
                in_arc.lock().unwrap().queue.extend(pdus);
                return;
            }
        } else {
            och.queue.extend(pdus);
            drop(och);
        }
        drop(st);
        self.sched.signal(out_slot);
    }

    /// Diagnostic dump of the context pool.
    pub fn report(&self) {
        tracing::info!("HTTP contexts:");
        tracing::info!("slot  fd  src->dst  chan  endpoint  user");
        for (i, slot) in self.contexts.iter().enumerate() {
            let ctx = slot.lock().unwrap();
            if !ctx.connection.is_active() {
                continue;
            }
            let chan = match ctx.channel_kind() {
                ChannelKind::None => "NONE",
                ChannelKind::In => "IN",
                ChannelKind::Out => "OUT",
            };
            tracing::info!(
                "{i:<4}  {:<3}  {:?}->{:?}  {chan}  [{}]:{}  {}",
                ctx.connection.raw_fd().unwrap_or(-1),
                ctx.connection.peer,
                ctx.connection.local,
                ctx.host,
                ctx.port,
                ctx.username,
            );
        }
    }
}

/// A started gateway; dropping it stops the threads.
pub struct RunningGateway {
    svc: Arc<GatewayService>,
    handles: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RunningGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &Arc<GatewayService> {
        &self.svc
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    /// Blocks on the service threads; returns only after a shutdown.
    pub fn join(mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.svc.registry().clear();
    }

    fn stop_inner(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.svc.shutdown_async();
        self.svc.sched.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        // Drop the processors with every thread quiesced.
        self.svc.registry.clear();
    }
}

impl Drop for RunningGateway {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

// ---------------------------------------------------------------------------
// Channel-gate operations
// ---------------------------------------------------------------------------

/// The [`ChannelGate`] the RTS layer sees while parsing a PDU for one
/// context. Never constructed with a VC lock held.
pub(crate) struct GateCtx<'a> {
    svc: &'a GatewayService,
    ctx: &'a mut HttpContext,
}

impl<'a> GateCtx<'a> {
    pub(crate) fn new(svc: &'a GatewayService, ctx: &'a mut HttpContext) -> GateCtx<'a> {
        GateCtx { svc, ctx }
    }
}

impl ChannelGate for GateCtx<'_> {
    fn channel_kind(&self) -> ChannelKind {
        self.ctx.channel_kind()
    }

    fn endpoint(&self) -> (&str, u16) {
        (&self.ctx.host, self.ctx.port)
    }

    fn bind_channel(&mut self, binding: &ChannelBinding) -> bool {
        match &self.ctx.channel {
            ChannelRef::In(arc) => {
                let mut ch = arc.lock().unwrap();
                ch.connection_cookie = binding.connection_cookie.clone();
                ch.channel_cookie = binding.channel_cookie.clone();
                ch.life_time = binding.life_time;
                ch.client_keepalive = binding.client_keepalive;
                ch.assoc_group_id = binding.assoc_group_id.clone();
                if binding.window_size > 0 {
                    ch.available_window = binding.window_size;
                }
                // The binding PDU is what opens an IN channel.
                ch.state = ChannelState::Opened;
                true
            }
            ChannelRef::Out(arc) => {
                let mut ch = arc.lock().unwrap();
                ch.connection_cookie = binding.connection_cookie.clone();
                ch.channel_cookie = binding.channel_cookie.clone();
                ch.client_keepalive = binding.client_keepalive;
                ch.window_size = binding.window_size;
                ch.available_window
                    .store(binding.window_size, Ordering::Release);
                true
            }
            ChannelRef::None => false,
        }
    }

    fn try_create_vconnection(&mut self) -> bool {
        let Some(cookie) = self.ctx.connection_cookie() else {
            return false;
        };
        if cookie.is_empty() {
            return false;
        }
        loop {
            if let Some(vr) = self
                .svc
                .registry
                .get(&self.ctx.host, self.ctx.port, &cookie)
            {
                let mut st = vr.lock();
                match &self.ctx.channel {
                    ChannelRef::Out(arc) => {
                        st.ctx_out = Some(OutSlot {
                            slot: self.ctx.slot,
                            channel: arc.clone(),
                        });
                        return true;
                    }
                    ChannelRef::In(arc) => {
                        st.ctx_in = Some(InSlot {
                            slot: self.ctx.slot,
                            channel: arc.clone(),
                        });
                        let out_slot = st.ctx_out.as_ref().map(|o| o.slot);
                        drop(st);
                        drop(vr);
                        if let Some(slot) = out_slot {
                            self.svc.sched.signal(slot);
                        }
                        return true;
                    }
                    ChannelRef::None => return false,
                }
            }

            let engine = self.svc.engine.clone();
            let host = self.ctx.host.clone();
            let port = self.ctx.port;
            match self
                .svc
                .registry
                .create_with(&host, port, &cookie, || engine.create_processor(&host, port))
            {
                CreateOutcome::Created(vr) => {
                    let mut st = vr.lock();
                    match &self.ctx.channel {
                        ChannelRef::Out(arc) => {
                            st.ctx_out = Some(OutSlot {
                                slot: self.ctx.slot,
                                channel: arc.clone(),
                            });
                        }
                        ChannelRef::In(arc) => {
                            st.ctx_in = Some(InSlot {
                                slot: self.ctx.slot,
                                channel: arc.clone(),
                            });
                        }
                        ChannelRef::None => return false,
                    }
                    return true;
                }
                CreateOutcome::Raced => continue,
                CreateOutcome::Full => return false,
                CreateOutcome::NoProcessor => {
                    tracing::debug!(
                        host = %self.ctx.host,
                        port = self.ctx.port,
                        "failed to create processor"
                    );
                    return false;
                }
            }
        }
    }

    fn set_keep_alive(&mut self, keepalive: Duration) {
        let ChannelRef::In(arc) = self.ctx.channel.clone() else {
            return;
        };
        let Some(cookie) = self.ctx.connection_cookie() else {
            return;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return;
        };
        let st = vr.lock();
        if st.ctx_in.as_ref().map(|s| s.slot) != Some(self.ctx.slot) {
            return;
        }
        arc.lock().unwrap().client_keepalive = keepalive;
        if let Some(out_arc) = st.ctx_out.as_ref().map(|o| o.channel.clone()) {
            out_arc.lock().unwrap().client_keepalive = keepalive;
        }
    }

    fn set_out_flow_control(&mut self, bytes_received: u32, available_window: u32) {
        if self.ctx.channel_kind() != ChannelKind::In {
            return;
        }
        let Some(cookie) = self.ctx.connection_cookie() else {
            return;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return;
        };
        let st = vr.lock();
        let Some((out_arc, out_slot)) = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot))
        else {
            return;
        };
        let och = out_arc.lock().unwrap();
        let sent = och.bytes_sent.load(Ordering::Acquire);
        let acked = bytes_received.wrapping_add(available_window);
        if acked > sent {
            och.available_window.store(acked - sent, Ordering::Release);
            drop(och);
            drop(st);
            self.svc.sched.signal(out_slot);
        } else {
            och.available_window.store(0, Ordering::Release);
        }
    }

    fn recycle_in_channel(&mut self, predecessor_cookie: &str) -> bool {
        let ChannelRef::In(my_arc) = self.ctx.channel.clone() else {
            return false;
        };
        let Some(cookie) = self.ctx.connection_cookie() else {
            return false;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return false;
        };
        let mut st = vr.lock();
        let Some(pred_arc) = st.ctx_in.as_ref().map(|s| s.channel.clone()) else {
            return false;
        };
        {
            let pred = pred_arc.lock().unwrap();
            if pred.channel_cookie != predecessor_cookie {
                return false;
            }
            let mut mine = my_arc.lock().unwrap();
            mine.life_time = pred.life_time;
            mine.client_keepalive = pred.client_keepalive;
            mine.available_window = pred.available_window;
            mine.bytes_received = pred.bytes_received;
            mine.assoc_group_id = pred.assoc_group_id.clone();
            // Not live until activation.
            mine.state = ChannelState::OpenStart;
        }
        st.ctx_in_succ = Some(InSlot {
            slot: self.ctx.slot,
            channel: my_arc,
        });
        true
    }

    fn recycle_out_channel(&mut self, predecessor_cookie: &str) -> bool {
        let ChannelRef::Out(my_arc) = self.ctx.channel.clone() else {
            return false;
        };
        let Some(cookie) = self.ctx.connection_cookie() else {
            return false;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return false;
        };
        let mut st = vr.lock();
        let Some((pred_arc, pred_slot)) = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot))
        else {
            return false;
        };
        {
            let mut pred = pred_arc.lock().unwrap();
            if pred.channel_cookie != predecessor_cookie || !pred.obsolete {
                return false;
            }
            let ok = pred.call.as_mut().map(|c| c.out_r2_a6()).unwrap_or(false);
            if !ok {
                return false;
            }
            let pdus = pred.call.as_mut().unwrap().take_output();
            pred.queue.extend(pdus);
            let mut mine = my_arc.lock().unwrap();
            mine.client_keepalive = pred.client_keepalive;
            mine.available_window
                .store(pred.window_size, Ordering::Release);
            mine.window_size = pred.window_size;
            mine.state = ChannelState::Recycling;
        }
        st.ctx_out_succ = Some(OutSlot {
            slot: self.ctx.slot,
            channel: my_arc,
        });
        drop(st);
        drop(vr);
        self.svc.sched.signal(pred_slot);
        true
    }

    fn activate_in_recycling(&mut self, successor_cookie: &str) -> bool {
        let ChannelRef::In(my_arc) = self.ctx.channel.clone() else {
            return false;
        };
        let Some(cookie) = self.ctx.connection_cookie() else {
            return false;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return false;
        };
        let mut st = vr.lock();
        // Only the staged successor itself may activate.
        if st.ctx_in_succ.as_ref().map(|s| s.slot) != Some(self.ctx.slot) {
            return false;
        }
        if my_arc.lock().unwrap().channel_cookie != successor_cookie {
            return false;
        }
        if let Some(pred_arc) = st.ctx_in.as_ref().map(|s| s.channel.clone()) {
            pred_arc.lock().unwrap().state = ChannelState::Recycled;
        }
        let successor = st.ctx_in_succ.take();
        st.ctx_in = successor;
        my_arc.lock().unwrap().state = ChannelState::Opened;
        true
    }

    fn activate_out_recycling(&mut self, successor_cookie: &str) -> bool {
        // B3 arrives on the IN channel.
        let ChannelRef::In(_) = self.ctx.channel else {
            return false;
        };
        let Some(cookie) = self.ctx.connection_cookie() else {
            return false;
        };
        let Some(vr) = self
            .svc
            .registry
            .get(&self.ctx.host, self.ctx.port, &cookie)
        else {
            return false;
        };
        let mut st = vr.lock();
        if st.ctx_in.as_ref().map(|s| s.slot) != Some(self.ctx.slot) {
            return false;
        }
        let Some((cur_arc, cur_slot)) = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot))
        else {
            return false;
        };
        let succ_ok = st
            .ctx_out_succ
            .as_ref()
            .map(|o| o.channel.lock().unwrap().channel_cookie == successor_cookie)
            .unwrap_or(false);
        if !succ_ok {
            return false;
        }
        {
            let mut och = cur_arc.lock().unwrap();
            let ok = och.call.as_mut().map(|c| c.out_r2_b3()).unwrap_or(false);
            if !ok {
                tracing::debug!(ctx = self.ctx.slot, "fail to set up r2/b3");
                return false;
            }
            let pdus = och.call.as_mut().unwrap().take_output();
            och.queue.extend(pdus);
        }
        let successor = st.ctx_out_succ.take();
        st.ctx_out = successor;
        let new_slot = st.ctx_out.as_ref().map(|o| o.slot);
        drop(st);
        drop(vr);
        self.svc.sched.signal(cur_slot);
        if let Some(slot) = new_slot {
            self.svc.sched.signal(slot);
        }
        true
    }

    fn password_for(&self, username: &str) -> Option<String> {
        if username.eq_ignore_ascii_case(&self.ctx.username) {
            Some(self.ctx.password.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::channel::{RpcInChannel, RpcOutChannel};
    use crate::pdu::{CallerInfo, PduDisposition, PduProcessor, RtsCall};

    struct NullProcessor;

    impl PduProcessor for NullProcessor {
        fn input(&mut self, _caller: &CallerInfo<'_>, _pdu: &[u8]) -> PduDisposition {
            PduDisposition::Input
        }
    }

    struct TapCall {
        marker: u8,
        pending: Vec<Pdu>,
    }

    impl TapCall {
        fn new(marker: u8) -> TapCall {
            TapCall {
                marker,
                pending: Vec::new(),
            }
        }

        fn emit(&mut self, tag: u8) -> bool {
            self.pending.push(Pdu::rts(vec![self.marker, tag]));
            true
        }
    }

    impl RtsCall for TapCall {
        fn take_output(&mut self) -> Vec<Pdu> {
            std::mem::take(&mut self.pending)
        }
        fn conn_c2(&mut self, _window_size: u32) -> bool {
            self.emit(0xc2)
        }
        fn ping(&mut self) -> bool {
            self.emit(0x01)
        }
        fn out_r2_a2(&mut self) -> bool {
            self.emit(0xa2)
        }
        fn out_r2_a6(&mut self) -> bool {
            self.emit(0xa6)
        }
        fn out_r2_b3(&mut self) -> bool {
            self.emit(0xb3)
        }
        fn flow_control_ack(&mut self, _b: u32, _w: u32, _c: &str) -> bool {
            self.emit(0xfa)
        }
    }

    struct NullEngine;

    impl PduEngine for NullEngine {
        fn create_processor(&self, _host: &str, _port: u16) -> Option<Box<dyn PduProcessor>> {
            Some(Box::new(NullProcessor))
        }
        fn rts_input(&self, _gate: &mut dyn ChannelGate, _pdu: &[u8]) -> PduDisposition {
            PduDisposition::Input
        }
        fn flow_control_ack(&self, _b: u32, _w: u32, _c: &str) -> Option<Pdu> {
            Some(Pdu::rts(vec![0xfa]))
        }
        fn echo_body(&self) -> Vec<u8> {
            vec![0u8; 20]
        }
    }

    fn test_service() -> Arc<GatewayService> {
        let config = GatewayConfig {
            context_num: 8,
            ..Default::default()
        };
        GatewayBuilder::new(config)
            .engine(Arc::new(NullEngine))
            .auth(Arc::new(StaticAuth::new().user("u", "p", "/m/u")))
            .build()
            .unwrap()
    }

    fn in_ctx(svc: &Arc<GatewayService>, slot: SlotId, cookie: &str, chan_cookie: &str) -> HttpContext {
        let mut ctx = HttpContext::new(slot, svc.pool.clone());
        ctx.host = "h".into();
        ctx.port = 6001;
        ctx.channel = ChannelRef::In(Arc::new(Mutex::new(RpcInChannel {
            connection_cookie: cookie.into(),
            channel_cookie: chan_cookie.into(),
            state: ChannelState::Opened,
            ..Default::default()
        })));
        ctx
    }

    fn out_ctx(
        svc: &Arc<GatewayService>,
        slot: SlotId,
        cookie: &str,
        chan_cookie: &str,
    ) -> HttpContext {
        let mut ctx = HttpContext::new(slot, svc.pool.clone());
        ctx.host = "h".into();
        ctx.port = 6001;
        let ch = RpcOutChannel {
            connection_cookie: cookie.into(),
            channel_cookie: chan_cookie.into(),
            window_size: 65536,
            state: ChannelState::Opened,
            call: Some(Box::new(TapCall::new(0x0f))),
            ..Default::default()
        };
        ch.available_window.store(65536, Ordering::Release);
        ctx.channel = ChannelRef::Out(Arc::new(Mutex::new(ch)));
        ctx
    }

    fn bind(svc: &Arc<GatewayService>, ctx: &mut HttpContext) -> bool {
        let mut gate = GateCtx::new(svc, ctx);
        gate.try_create_vconnection()
    }

    #[test]
    fn pairing_binds_both_slots() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));
        let vr = svc.registry.get("h", 6001, "ck").unwrap();
        let st = vr.lock();
        assert_eq!(st.ctx_out.as_ref().map(|o| o.slot), Some(0));
        assert_eq!(st.ctx_in.as_ref().map(|i| i.slot), Some(1));
        assert!(st.processor.is_some());
    }

    #[test]
    fn in_recycling_inherits_and_activates() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));
        if let ChannelRef::In(arc) = &inn.channel {
            let mut ch = arc.lock().unwrap();
            ch.life_time = 7;
            ch.available_window = 1234;
            ch.bytes_received = 99;
            ch.assoc_group_id = "ag".into();
        }

        // The successor presents the predecessor's channel cookie.
        let mut succ = in_ctx(&svc, 2, "ck", "in2");
        {
            let mut gate = GateCtx::new(&svc, &mut succ);
            assert!(gate.recycle_in_channel("in1"));
            assert!(!gate.recycle_in_channel("bogus"));
        }
        if let ChannelRef::In(arc) = &succ.channel {
            let ch = arc.lock().unwrap();
            assert_eq!(ch.life_time, 7);
            assert_eq!(ch.available_window, 1234);
            assert_eq!(ch.bytes_received, 99);
            assert_eq!(ch.assoc_group_id, "ag");
            assert_eq!(ch.state, ChannelState::OpenStart);
        }

        {
            let mut gate = GateCtx::new(&svc, &mut succ);
            assert!(gate.activate_in_recycling("in2"));
        }
        let vr = svc.registry.get("h", 6001, "ck").unwrap();
        let st = vr.lock();
        assert_eq!(st.ctx_in.as_ref().map(|s| s.slot), Some(2));
        assert!(st.ctx_in_succ.is_none());
        drop(st);
        if let ChannelRef::In(arc) = &inn.channel {
            assert_eq!(arc.lock().unwrap().state, ChannelState::Recycled);
        }
        if let ChannelRef::In(arc) = &succ.channel {
            assert_eq!(arc.lock().unwrap().state, ChannelState::Opened);
        }
    }

    #[test]
    fn stale_successor_cannot_activate() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));
        // No successor staged: activation must refuse.
        let mut intruder = in_ctx(&svc, 3, "ck", "in3");
        let mut gate = GateCtx::new(&svc, &mut intruder);
        assert!(!gate.activate_in_recycling("in3"));
    }

    #[test]
    fn out_recycling_requires_obsolete_predecessor() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));

        let mut succ = out_ctx(&svc, 2, "ck", "out2");
        {
            let mut gate = GateCtx::new(&svc, &mut succ);
            // Predecessor not yet obsolete.
            assert!(!gate.recycle_out_channel("out1"));
        }
        if let ChannelRef::Out(arc) = &out.channel {
            arc.lock().unwrap().obsolete = true;
        }
        {
            let mut gate = GateCtx::new(&svc, &mut succ);
            assert!(gate.recycle_out_channel("out1"));
        }
        // Predecessor got the A6 control PDU queued.
        if let ChannelRef::Out(arc) = &out.channel {
            let ch = arc.lock().unwrap();
            assert_eq!(ch.queue.len(), 1);
        }
        if let ChannelRef::Out(arc) = &succ.channel {
            let ch = arc.lock().unwrap();
            assert_eq!(ch.window_size, 65536);
            assert_eq!(ch.state, ChannelState::Recycling);
        }

        // Activation from the IN side.
        {
            let mut gate = GateCtx::new(&svc, &mut inn);
            assert!(gate.activate_out_recycling("out2"));
        }
        let vr = svc.registry.get("h", 6001, "ck").unwrap();
        let st = vr.lock();
        assert_eq!(st.ctx_out.as_ref().map(|s| s.slot), Some(2));
        assert!(st.ctx_out_succ.is_none());
        drop(st);
        // Predecessor queue now also has the B3.
        if let ChannelRef::Out(arc) = &out.channel {
            assert_eq!(arc.lock().unwrap().queue.len(), 2);
        }
    }

    #[test]
    fn flow_control_refills_out_window() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));
        let och_arc = match &out.channel {
            ChannelRef::Out(arc) => arc.clone(),
            _ => unreachable!(),
        };
        och_arc.lock().unwrap().bytes_sent.store(1000, Ordering::Release);
        {
            let mut gate = GateCtx::new(&svc, &mut inn);
            gate.set_out_flow_control(900, 65536);
        }
        assert_eq!(och_arc.lock().unwrap().window(), 900 + 65536 - 1000);
        {
            let mut gate = GateCtx::new(&svc, &mut inn);
            // Acknowledged less than already sent: no credit.
            gate.set_out_flow_control(100, 200);
        }
        assert_eq!(och_arc.lock().unwrap().window(), 0);
    }

    #[test]
    fn async_reply_routes_by_obsolete_flag() {
        let svc = test_service();
        let mut out = out_ctx(&svc, 0, "ck", "out1");
        let mut inn = in_ctx(&svc, 1, "ck", "in1");
        assert!(bind(&svc, &mut out));
        assert!(bind(&svc, &mut inn));

        svc.vconnection_async_reply("h", 6001, "ck", vec![Pdu::payload(vec![1])]);
        let och_arc = match &out.channel {
            ChannelRef::Out(arc) => arc.clone(),
            _ => unreachable!(),
        };
        assert_eq!(och_arc.lock().unwrap().queue.len(), 1);

        och_arc.lock().unwrap().obsolete = true;
        svc.vconnection_async_reply("h", 6001, "ck", vec![Pdu::payload(vec![2])]);
        let ich_arc = match &inn.channel {
            ChannelRef::In(arc) => arc.clone(),
            _ => unreachable!(),
        };
        assert_eq!(ich_arc.lock().unwrap().queue.len(), 1);
        assert_eq!(och_arc.lock().unwrap().queue.len(), 1);

        // After shutdown_async nothing is queued anymore.
        svc.shutdown_async();
        svc.vconnection_async_reply("h", 6001, "ck", vec![Pdu::payload(vec![3])]);
        assert_eq!(och_arc.lock().unwrap().queue.len(), 1);
        assert_eq!(ich_arc.lock().unwrap().queue.len(), 1);
    }

    #[test]
    fn password_echoes_only_for_matching_user() {
        let svc = test_service();
        let mut ctx = HttpContext::new(0, svc.pool.clone());
        ctx.username = "User".into();
        ctx.password = "secret".into();
        let gate = GateCtx::new(&svc, &mut ctx);
        assert_eq!(gate.password_for("user"), Some("secret".into()));
        assert_eq!(gate.password_for("other"), None);
    }
}
