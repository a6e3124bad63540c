// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The per-tunnel state machine.
//!
//! Each state function is a pure transformation from context to a scheduler
//! verdict; errors become error pages or a closed transport, never panics.
//! The dispatch order is INITSSL → RDHEAD → RDBODY → WRREP → WAIT, with the
//! RPC tunnel states threading through RDBODY/WRREP/WAIT for the rest of the
//! channel's life.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::auth::Privilege;
use crate::channel::{
    recycling_due, ChannelState, RpcInChannel, RpcOutChannel, OUT_CHANNEL_MAX_LENGTH,
    OUT_CHANNEL_MAX_WAIT, WINDOW_FLOOR,
};
use crate::connection::{Connection, HandshakeOutcome, IoOutcome};
use crate::delegate::{ContentHandler, HandlerSession, Retrieve};
use crate::error::{error_page, rfc1123_now, HttpStatus};
use crate::pdu::{
    frag_length, CallerInfo, ChannelKind, PduDisposition, RtsCall, ECHO_MAX_LENGTH, FRAG_HDR_MIN,
};
use crate::request::{self, HttpRequest};
use crate::scheduler::Verdict;
use crate::service::{GateCtx, GatewayService};
use crate::stream::{ByteStream, LineStatus};
use crate::vconn::SlotId;

/// Dispatch states of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    InitTls,
    RdHead,
    RdBody,
    WrRep,
    Wait,
    Closed,
}

/// Channel binding of a context. A binding other than `None` means the
/// context was promoted to an MS-RPCH tunnel and its body is framed as
/// DCE/RPC PDUs.
#[derive(Clone, Default)]
pub enum ChannelRef {
    #[default]
    None,
    In(Arc<Mutex<RpcInChannel>>),
    Out(Arc<Mutex<RpcOutChannel>>),
}

impl ChannelRef {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelRef::None => ChannelKind::None,
            ChannelRef::In(_) => ChannelKind::In,
            ChannelRef::Out(_) => ChannelKind::Out,
        }
    }
}

/// Where the current write window was filled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteSource {
    None,
    /// The out-stream: response heads, error pages, handler output.
    Stream,
    /// The head of the OUT channel's PDU queue.
    OutQueue,
}

/// A claimed request's handler and its per-context state.
pub struct Delegation {
    pub handler: Arc<dyn ContentHandler>,
    pub session: HandlerSession,
}

pub struct HttpContext {
    pub slot: SlotId,
    pub connection: Connection,
    pub request: HttpRequest,
    pub sched_state: SchedState,
    pub stream_in: ByteStream,
    pub stream_out: ByteStream,
    pub write_buf: Vec<u8>,
    pub write_offset: usize,
    pub write_is_rts: bool,
    pub write_src: WriteSource,
    /// Declared request length, or the response budget on an OUT channel.
    pub total_length: u64,
    pub bytes_rw: u64,
    pub close_after_reply: bool,
    pub authed: bool,
    pub auth_times: u32,
    pub username: String,
    pub password: String,
    pub maildir: String,
    pub lang: String,
    /// RPC endpoint from the rpcproxy URI.
    pub host: String,
    pub port: u16,
    pub channel: ChannelRef,
    pub delegation: Option<Delegation>,
}

impl HttpContext {
    pub fn new(slot: SlotId, pool: Arc<crate::stream::ChunkPool>) -> HttpContext {
        HttpContext {
            slot,
            connection: Connection::default(),
            request: HttpRequest::default(),
            sched_state: SchedState::Closed,
            stream_in: ByteStream::new(pool.clone()),
            stream_out: ByteStream::new(pool),
            write_buf: Vec::new(),
            write_offset: 0,
            write_is_rts: false,
            write_src: WriteSource::None,
            total_length: 0,
            bytes_rw: 0,
            close_after_reply: true,
            authed: false,
            auth_times: 0,
            username: String::new(),
            password: String::new(),
            maildir: String::new(),
            lang: String::new(),
            host: String::new(),
            port: 0,
            channel: ChannelRef::None,
            delegation: None,
        }
    }

    /// Resets everything for reuse by the next tunnel.
    pub fn clear(&mut self) {
        self.connection.reset();
        self.request.clear();
        self.sched_state = SchedState::Closed;
        self.stream_in.clear();
        self.stream_out.clear();
        self.reset_write_window();
        self.total_length = 0;
        self.bytes_rw = 0;
        self.close_after_reply = true;
        self.authed = false;
        self.auth_times = 0;
        self.username.clear();
        self.password.clear();
        self.maildir.clear();
        self.lang.clear();
        self.host.clear();
        self.port = 0;
        self.channel = ChannelRef::None;
        self.delegation = None;
    }

    pub fn reset_write_window(&mut self) {
        self.write_buf.clear();
        self.write_offset = 0;
        self.write_is_rts = false;
        self.write_src = WriteSource::None;
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// The connection cookie of the bound channel, once the binding PDU set
    /// it.
    pub fn connection_cookie(&self) -> Option<String> {
        match &self.channel {
            ChannelRef::None => None,
            ChannelRef::In(c) => Some(c.lock().unwrap().connection_cookie.clone()),
            ChannelRef::Out(c) => Some(c.lock().unwrap().connection_cookie.clone()),
        }
    }

    fn frag_length(&self) -> u16 {
        match &self.channel {
            ChannelRef::None => 0,
            ChannelRef::In(c) => c.lock().unwrap().frag_length,
            ChannelRef::Out(c) => c.lock().unwrap().frag_length,
        }
    }

    fn set_frag_length(&self, frag: u16) {
        match &self.channel {
            ChannelRef::None => {}
            ChannelRef::In(c) => c.lock().unwrap().frag_length = frag,
            ChannelRef::Out(c) => c.lock().unwrap().frag_length = frag,
        }
    }

    fn is_rpc_method(&self) -> bool {
        self.request.method.eq_ignore_ascii_case("RPC_IN_DATA")
            || self.request.method.eq_ignore_ascii_case("RPC_OUT_DATA")
    }
}

enum ReadOutcome {
    Data(u64),
    NotReady,
    Closed,
    Failed,
    NoMem,
}

impl GatewayService {
    /// Runs the context until it parks, closes, or yields. This is the whole
    /// per-step contract: LOOP never escapes, RUNOFF becomes a teardown.
    pub(crate) fn step(&self, ctx: &mut HttpContext) -> Verdict {
        loop {
            let verdict = match ctx.sched_state {
                SchedState::InitTls => self.step_init_tls(ctx),
                SchedState::RdHead => self.step_rdhead(ctx),
                SchedState::RdBody => self.step_rdbody(ctx),
                SchedState::WrRep => self.step_wrrep(ctx),
                SchedState::Wait => self.step_wait(ctx),
                SchedState::Closed => Verdict::Runoff,
            };
            match verdict {
                Verdict::Loop => continue,
                Verdict::Runoff => return self.end_context(ctx),
                other => return other,
            }
        }
    }

    /// Stages an error page and moves to WRREP. Errored tunnels always close
    /// after the reply.
    fn respond_error(&self, ctx: &mut HttpContext, status: HttpStatus) -> Verdict {
        ctx.close_after_reply = true;
        self.release_delegation(ctx);
        if self.debug.response_logging > 0 {
            tracing::debug!(ctx = ctx.slot, %status, "error reply");
        }
        let page = error_page(status);
        ctx.stream_out.clear();
        if ctx.stream_out.append(page.as_bytes()).is_err() {
            return Verdict::Runoff;
        }
        ctx.total_length = page.len() as u64;
        ctx.bytes_rw = 0;
        ctx.reset_write_window();
        ctx.sched_state = SchedState::WrRep;
        Verdict::Loop
    }

    /// Stages a normal reply and moves to WRREP.
    fn stage_reply(&self, ctx: &mut HttpContext, head: &str, body: &[u8]) -> Verdict {
        if ctx.stream_out.append(head.as_bytes()).is_err()
            || ctx.stream_out.append(body).is_err()
        {
            tracing::error!("ENOMEM staging reply");
            return Verdict::Runoff;
        }
        ctx.total_length = (head.len() + body.len()) as u64;
        ctx.bytes_rw = 0;
        ctx.reset_write_window();
        ctx.sched_state = SchedState::WrRep;
        Verdict::Loop
    }

    fn release_delegation(&self, ctx: &mut HttpContext) {
        if let Some(mut d) = ctx.delegation.take() {
            d.handler.release(&mut d.session);
        }
    }

    /// Final teardown: unbind the channel from its virtual connection, close
    /// the transport, reset the context for reuse.
    fn end_context(&self, ctx: &mut HttpContext) -> Verdict {
        self.release_delegation(ctx);
        if let Some(cookie) = ctx.connection_cookie() {
            if let Some(vr) = self.registry().get(&ctx.host, ctx.port, &cookie) {
                let mut st = vr.lock();
                match ctx.channel_kind() {
                    ChannelKind::In => {
                        if st.ctx_in.as_ref().map(|s| s.slot) == Some(ctx.slot) {
                            st.ctx_in = None;
                        }
                        if st.ctx_in_succ.as_ref().map(|s| s.slot) == Some(ctx.slot) {
                            st.ctx_in_succ = None;
                        }
                    }
                    ChannelKind::Out => {
                        if st.ctx_out.as_ref().map(|s| s.slot) == Some(ctx.slot) {
                            st.ctx_out = None;
                        }
                        if st.ctx_out_succ.as_ref().map(|s| s.slot) == Some(ctx.slot) {
                            st.ctx_out_succ = None;
                        }
                    }
                    ChannelKind::None => {}
                }
            }
        }
        ctx.clear();
        Verdict::Close
    }

    // ------------------------------------------------------------------
    // INITSSL
    // ------------------------------------------------------------------

    fn step_init_tls(&self, ctx: &mut HttpContext) -> Verdict {
        let Some(tls) = self.tls_context() else {
            ctx.sched_state = SchedState::RdHead;
            return Verdict::Loop;
        };
        match ctx.connection.drive_handshake(tls) {
            HandshakeOutcome::Done => {
                ctx.sched_state = SchedState::RdHead;
                Verdict::Cont
            }
            HandshakeOutcome::NotReady => {
                if ctx.connection.last_activity.elapsed() < self.timeout() {
                    Verdict::PollRead
                } else {
                    tracing::debug!(ctx = ctx.slot, "TLS accept timeout");
                    self.respond_error(ctx, HttpStatus::REQUEST_TIMEOUT)
                }
            }
            HandshakeOutcome::Failed => Verdict::Runoff,
        }
    }

    // ------------------------------------------------------------------
    // RDHEAD
    // ------------------------------------------------------------------

    fn read_into_stream(&self, ctx: &mut HttpContext) -> ReadOutcome {
        let spare = match ctx.stream_in.write_buf() {
            Ok(s) => s,
            Err(_) => return ReadOutcome::NoMem,
        };
        match ctx.connection.read(spare) {
            IoOutcome::Done(n) => {
                self.debug
                    .dump_read(ctx.connection.peer, ctx.connection.local, &spare[..n]);
                ctx.connection.last_activity = Instant::now();
                ctx.stream_in.commit_write(n);
                ReadOutcome::Data(n as u64)
            }
            IoOutcome::Closed => ReadOutcome::Closed,
            IoOutcome::NotReady => ReadOutcome::NotReady,
            IoOutcome::Failed => ReadOutcome::Failed,
        }
    }

    fn step_rdhead(&self, ctx: &mut HttpContext) -> Verdict {
        match self.read_into_stream(ctx) {
            ReadOutcome::Data(_) => self.parse_head(ctx, true),
            ReadOutcome::Closed | ReadOutcome::Failed => {
                tracing::debug!(ctx = ctx.slot, "connection lost");
                Verdict::Runoff
            }
            ReadOutcome::NotReady => {
                if ctx.connection.last_activity.elapsed() < self.timeout() {
                    // Pipelined bytes may already hold a full head.
                    self.parse_head(ctx, false)
                } else {
                    tracing::debug!(ctx = ctx.slot, "timeout reading request head");
                    self.respond_error(ctx, HttpStatus::REQUEST_TIMEOUT)
                }
            }
            ReadOutcome::NoMem => {
                tracing::error!("ENOMEM growing in-stream");
                self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED)
            }
        }
    }

    fn parse_head(&self, ctx: &mut HttpContext, had_data: bool) -> Verdict {
        loop {
            match ctx.stream_in.line_status() {
                LineStatus::Fail => {
                    tracing::debug!(ctx = ctx.slot, "request header line too long");
                    return self.respond_error(ctx, HttpStatus::BAD_REQUEST);
                }
                LineStatus::Unavailable => {
                    return if had_data {
                        Verdict::Cont
                    } else {
                        Verdict::PollRead
                    };
                }
                LineStatus::Available => {}
            }

            let parse = {
                let first = ctx.request.method.is_empty();
                let line = ctx.stream_in.read_line();
                if line.is_empty() {
                    if first {
                        // Extraneous blank lines before the request line.
                        continue;
                    }
                    None // end of headers
                } else if first {
                    Some(request::parse_request_line(
                        &mut ctx.request,
                        line,
                        &mut ctx.close_after_reply,
                        self.rewriter(),
                    ))
                } else {
                    Some(request::parse_header_line(
                        &mut ctx.request,
                        line,
                        &mut ctx.close_after_reply,
                    ))
                }
            };
            match parse {
                Some(Ok(())) => continue,
                Some(Err(status)) => {
                    tracing::debug!(ctx = ctx.slot, %status, "request head rejected");
                    return self.respond_error(ctx, status);
                }
                None => break,
            }
        }

        if ctx.stream_in.reconstruct().is_err() {
            tracing::error!("ENOMEM compacting in-stream");
            return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
        }
        let leftover = ctx.stream_in.total_unread() as u64;

        if self.debug.request_logging > 0 {
            tracing::info!(
                ctx = ctx.slot,
                peer = ?ctx.connection.peer,
                "{}",
                ctx.request.request_line()
            );
            if self.debug.request_logging > 1 {
                for (k, v) in &ctx.request.others {
                    tracing::info!(ctx = ctx.slot, "  {k}: {v}");
                }
            }
        }

        if let Some(staged) = self.auth_from_header(ctx) {
            return staged;
        }
        if ctx.is_rpc_method() {
            return self.delegate_rpc(ctx, leftover);
        }
        match self.dispatcher().select(&ctx.request) {
            Err(status) => self.respond_error(ctx, status),
            Ok(Some(handler)) => self.delegate_handler(ctx, handler),
            Ok(None) => self.respond_error(ctx, HttpStatus::NOT_FOUND),
        }
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    fn challenge_401(&self, ctx: &mut HttpContext, with_body: bool) -> Verdict {
        let head = if with_body {
            format!(
                "HTTP/1.1 401 Unauthorized\r\n\
                 Date: {}\r\n\
                 Keep-Alive: timeout={}\r\n\
                 Connection: close\r\n\
                 Content-Type: text/plain; charset=ascii\r\n\
                 Content-Length: 2\r\n\
                 WWW-Authenticate: Basic realm=\"msrpc realm\"\r\n\
                 \r\n\r\n",
                rfc1123_now(),
                self.timeout().as_secs()
            )
        } else {
            format!(
                "HTTP/1.1 401 Unauthorized\r\n\
                 Date: {}\r\n\
                 Content-Length: 0\r\n\
                 Keep-Alive: timeout={}\r\n\
                 Connection: close\r\n\
                 WWW-Authenticate: Basic realm=\"msrpc realm\"\r\n\
                 \r\n",
                rfc1123_now(),
                self.timeout().as_secs()
            )
        };
        self.stage_reply(ctx, &head, b"")
    }

    /// Decodes Basic credentials (when present) and runs the login. Returns
    /// the staged verdict when a reply was produced, None to continue
    /// dispatch.
    fn auth_from_header(&self, ctx: &mut HttpContext) -> Option<Verdict> {
        let (username, password) = ctx.request.basic_credentials()?;
        ctx.username = username;
        ctx.password = password;

        if !self.user_guard().permitted(&ctx.username) {
            tracing::debug!(user = %ctx.username, "user is denied by user filter");
            return Some(self.respond_error(ctx, HttpStatus::SERVICE_UNAVAILABLE));
        }

        match self
            .auth_backend()
            .login(&ctx.username, &ctx.password, Privilege::Exchange)
        {
            Ok(meta) => {
                if !meta.username.is_empty() {
                    ctx.username = meta.username;
                }
                ctx.maildir = meta.maildir;
                ctx.lang = meta.lang;
                if ctx.maildir.is_empty() {
                    tracing::error!(user = %ctx.username, "maildir absent, refusing tunnel");
                    return Some(self.challenge_401(ctx, false));
                }
                if ctx.lang.is_empty() {
                    if let Some(lang) = self.default_lang() {
                        ctx.lang = lang.to_string();
                    }
                }
                ctx.authed = true;
                tracing::debug!(user = %ctx.username, "auth success");
                None
            }
            Err(e) => {
                ctx.authed = false;
                tracing::error!(user = %ctx.username, "login failed: {e}");
                ctx.auth_times += 1;
                if ctx.auth_times >= self.max_auth_times() {
                    self.user_guard().hold(&ctx.username, self.block_duration());
                }
                Some(self.challenge_401(ctx, true))
            }
        }
    }

    // ------------------------------------------------------------------
    // Delegation
    // ------------------------------------------------------------------

    fn delegate_rpc(&self, ctx: &mut HttpContext, leftover: u64) -> Verdict {
        let Some(target) = request::parse_rpc_proxy_uri(&ctx.request.uri) else {
            tracing::debug!(ctx = ctx.slot, uri = %ctx.request.uri, "rpcproxy request error");
            return self.respond_error(ctx, HttpStatus::BAD_REQUEST);
        };
        ctx.host = target.host;
        ctx.port = target.port;

        if !ctx.authed {
            tracing::debug!(ctx = ctx.slot, "authentication needed");
            return self.challenge_401(ctx, false);
        }

        ctx.total_length = ctx.request.content_length();
        // Anything at or below the ECHO bound carries no channel.
        if ctx.total_length > ECHO_MAX_LENGTH {
            if ctx.request.method.eq_ignore_ascii_case("RPC_IN_DATA") {
                ctx.channel = ChannelRef::In(Arc::new(Mutex::new(RpcInChannel::default())));
            } else {
                ctx.channel = ChannelRef::Out(Arc::new(Mutex::new(RpcOutChannel::default())));
            }
        }
        ctx.bytes_rw = leftover;
        ctx.sched_state = SchedState::RdBody;
        Verdict::Loop
    }

    fn delegate_handler(&self, ctx: &mut HttpContext, handler: Arc<dyn ContentHandler>) -> Verdict {
        ctx.bytes_rw = 0;
        ctx.total_length = 0;
        ctx.delegation = Some(Delegation {
            handler,
            session: HandlerSession::default(),
        });
        if !self.feed_delegation(ctx) {
            return self.respond_error(ctx, HttpStatus::BAD_REQUEST);
        }
        let complete = {
            let d = ctx.delegation.as_mut().unwrap();
            let handler = d.handler.clone();
            handler.end_of_request(&mut d.session)
        };
        if !complete {
            ctx.sched_state = SchedState::RdBody;
            return Verdict::Loop;
        }
        self.finish_delegation_request(ctx)
    }

    /// Drains buffered body bytes into the claiming handler.
    fn feed_delegation(&self, ctx: &mut HttpContext) -> bool {
        let Some(d) = ctx.delegation.as_mut() else {
            return true;
        };
        let handler = d.handler.clone();
        loop {
            let block = ctx.stream_in.readable();
            if block.is_empty() {
                return true;
            }
            if !handler.write_request(&mut d.session, block) {
                return false;
            }
            let n = block.len();
            ctx.stream_in.fwd_read(n);
        }
    }

    fn finish_delegation_request(&self, ctx: &mut HttpContext) -> Verdict {
        let result = {
            let d = ctx.delegation.as_mut().unwrap();
            let handler = d.handler.clone();
            handler.execute(&mut d.session, &ctx.request, &mut ctx.stream_out)
        };
        if let Err(status) = result {
            return self.respond_error(ctx, status);
        }
        ctx.sched_state = SchedState::WrRep;
        if ctx.stream_in.reconstruct().is_err() {
            tracing::error!("ENOMEM compacting in-stream");
            return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
        }
        Verdict::Loop
    }

    // ------------------------------------------------------------------
    // RDBODY
    // ------------------------------------------------------------------

    fn step_rdbody(&self, ctx: &mut HttpContext) -> Verdict {
        match ctx.channel_kind() {
            ChannelKind::None => self.step_rdbody_nochan(ctx),
            ChannelKind::In | ChannelKind::Out => self.step_rdbody_channel(ctx),
        }
    }

    fn step_rdbody_nochan(&self, ctx: &mut HttpContext) -> Verdict {
        if ctx.delegation.is_some() {
            return self.read_body_delegated(ctx);
        }
        if ctx.bytes_rw < ctx.total_length {
            match self.read_into_stream(ctx) {
                ReadOutcome::Data(n) => {
                    ctx.bytes_rw += n;
                    if ctx.bytes_rw < ctx.total_length {
                        return Verdict::Cont;
                    }
                }
                ReadOutcome::NotReady => {
                    return if ctx.connection.last_activity.elapsed() < self.timeout() {
                        Verdict::PollRead
                    } else {
                        tracing::debug!(ctx = ctx.slot, "timeout reading body");
                        self.respond_error(ctx, HttpStatus::REQUEST_TIMEOUT)
                    };
                }
                ReadOutcome::Closed | ReadOutcome::Failed => {
                    tracing::debug!(ctx = ctx.slot, "connection lost");
                    return Verdict::Runoff;
                }
                ReadOutcome::NoMem => {
                    tracing::error!("ENOMEM growing in-stream");
                    return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
                }
            }
        }

        if !ctx.is_rpc_method() {
            tracing::debug!(ctx = ctx.slot, method = %ctx.request.method, "unrecognized HTTP method");
            return self.respond_error(ctx, HttpStatus::METHOD_NOT_ALLOWED);
        }

        // RPC ECHO request.
        let body = self.engine().echo_body();
        let head = format!(
            "HTTP/1.1 200 Success\r\n\
             Connection: Keep-Alive\r\n\
             Content-Length: {}\r\n\
             Content-Type: application/rpc\r\n\r\n",
            body.len()
        );
        let staged = self.stage_reply(ctx, &head, &body);
        if staged != Verdict::Loop {
            return staged;
        }
        if ctx.stream_in.reconstruct().is_err() {
            tracing::error!("ENOMEM compacting in-stream");
            return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
        }
        Verdict::Cont
    }

    fn read_body_delegated(&self, ctx: &mut HttpContext) -> Verdict {
        match self.read_into_stream(ctx) {
            ReadOutcome::Data(_) => {
                if !self.feed_delegation(ctx) {
                    return self.respond_error(ctx, HttpStatus::BAD_REQUEST);
                }
                let complete = {
                    let d = ctx.delegation.as_mut().unwrap();
                    let handler = d.handler.clone();
                    handler.end_of_request(&mut d.session)
                };
                if !complete {
                    return Verdict::Cont;
                }
                self.finish_delegation_request(ctx)
            }
            ReadOutcome::NotReady => {
                if ctx.connection.last_activity.elapsed() < self.timeout() {
                    Verdict::PollRead
                } else {
                    tracing::debug!(ctx = ctx.slot, "timeout reading body");
                    self.respond_error(ctx, HttpStatus::REQUEST_TIMEOUT)
                }
            }
            ReadOutcome::Closed | ReadOutcome::Failed => {
                tracing::debug!(ctx = ctx.slot, "connection lost");
                Verdict::Runoff
            }
            ReadOutcome::NoMem => {
                tracing::error!("ENOMEM growing in-stream");
                self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED)
            }
        }
    }

    fn step_rdbody_channel(&self, ctx: &mut HttpContext) -> Verdict {
        let mut frag = ctx.frag_length();
        let have = ctx.stream_in.total_unread();
        if have < FRAG_HDR_MIN || (frag > 0 && have < frag as usize) {
            match self.read_into_stream(ctx) {
                ReadOutcome::Data(n) => {
                    ctx.bytes_rw += n;
                    if ctx.bytes_rw > ctx.total_length {
                        tracing::debug!(ctx = ctx.slot, "content length overflow when reading body");
                        return Verdict::Runoff;
                    }
                }
                ReadOutcome::NotReady => {
                    return if ctx.connection.last_activity.elapsed() < self.timeout() {
                        Verdict::PollRead
                    } else {
                        tracing::debug!(ctx = ctx.slot, "timeout reading body");
                        self.respond_error(ctx, HttpStatus::REQUEST_TIMEOUT)
                    };
                }
                ReadOutcome::Closed | ReadOutcome::Failed => {
                    tracing::debug!(ctx = ctx.slot, "connection lost");
                    return Verdict::Runoff;
                }
                ReadOutcome::NoMem => {
                    tracing::error!("ENOMEM growing in-stream");
                    return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
                }
            }
        }

        let pdu = {
            let readable = ctx.stream_in.readable();
            if readable.is_empty() {
                return Verdict::PollRead;
            }
            if readable.len() < FRAG_HDR_MIN {
                return Verdict::Cont;
            }
            if frag == 0 {
                frag = frag_length(readable);
                if (frag as usize) < FRAG_HDR_MIN {
                    tracing::debug!(ctx = ctx.slot, frag, "bad fragment length");
                    return Verdict::Runoff;
                }
                ctx.set_frag_length(frag);
            }
            if readable.len() < frag as usize {
                return Verdict::Cont;
            }
            readable[..frag as usize].to_vec()
        };

        // RTS pre-parse, outside any VC lock.
        let mut result = {
            let mut gate = GateCtx::new(self, ctx);
            self.engine().rts_input(&mut gate, &pdu)
        };

        if let ChannelRef::In(ich_arc) = ctx.channel.clone() {
            let opened = ich_arc.lock().unwrap().state == ChannelState::Opened;
            if opened {
                match result {
                    PduDisposition::Error => {
                        // RTS parse errors on an opened IN channel are
                        // swallowed rather than fatal.
                        result = PduDisposition::Input;
                    }
                    PduDisposition::Forward => {
                        result = match self.forward_to_processor(ctx, &ich_arc, &pdu, frag) {
                            Ok(r) => r,
                            Err(v) => return v,
                        };
                    }
                    _ => {}
                }
            }
        }

        ctx.stream_in.fwd_read(frag as usize);
        ctx.set_frag_length(0);
        if ctx.stream_in.reconstruct().is_err() {
            tracing::error!("ENOMEM compacting in-stream");
            return self.respond_error(ctx, HttpStatus::RESOURCES_EXHAUSTED);
        }

        match result {
            PduDisposition::Error | PduDisposition::Forward => {
                tracing::debug!(ctx = ctx.slot, "pdu process error");
                Verdict::Runoff
            }
            PduDisposition::Input => Verdict::Cont,
            PduDisposition::Output(call) => self.route_output(ctx, call),
            PduDisposition::Terminate => Verdict::Runoff,
        }
    }

    /// FORWARD on an opened IN channel: route the PDU into the virtual
    /// connection's processor and do the receive-window accounting, all under
    /// the VC lock.
    fn forward_to_processor(
        &self,
        ctx: &mut HttpContext,
        ich_arc: &Arc<Mutex<RpcInChannel>>,
        pdu: &[u8],
        frag: u16,
    ) -> Result<PduDisposition, Verdict> {
        let cookie = ich_arc.lock().unwrap().connection_cookie.clone();
        let Some(vr) = self.registry().get(&ctx.host, ctx.port, &cookie) else {
            tracing::debug!(ctx = ctx.slot, "virtual connection error in hash table");
            return Err(Verdict::Runoff);
        };
        let mut st = vr.lock();
        let bound_here = st.ctx_in.as_ref().map(|s| s.slot) == Some(ctx.slot);
        if !bound_here || st.processor.is_none() {
            drop(st);
            tracing::debug!(ctx = ctx.slot, "virtual connection error in hash table");
            return Err(Verdict::Runoff);
        }

        let caller = CallerInfo {
            username: &ctx.username,
            password: &ctx.password,
        };
        let result = st.processor.as_mut().unwrap().input(&caller, pdu);

        let out_pair = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot));
        let mut ich = ich_arc.lock().unwrap();
        ich.available_window = ich.available_window.saturating_sub(frag as u32);
        ich.bytes_received = ich.bytes_received.wrapping_add(frag as u32);
        if !matches!(result, PduDisposition::Terminate | PduDisposition::Error) {
            if let Some((out_arc, out_slot)) = out_pair {
                let mut och = out_arc.lock().unwrap();
                if ich.available_window < och.window_size / 2 {
                    ich.available_window = och.window_size;
                    if let Some(ack) = self.engine().flow_control_ack(
                        ich.bytes_received,
                        ich.available_window,
                        &ich.channel_cookie,
                    ) {
                        och.queue.push(ack);
                        drop(och);
                        drop(ich);
                        drop(st);
                        self.sched().signal(out_slot);
                        return Ok(result);
                    }
                }
            }
        }
        Ok(result)
    }

    /// OUTPUT disposition: either the OUT channel is being opened, or an
    /// IN-channel call produced PDUs for the paired OUT channel.
    fn route_output(&self, ctx: &mut HttpContext, mut call: Box<dyn RtsCall>) -> Verdict {
        match ctx.channel.clone() {
            ChannelRef::Out(och_arc) => {
                let state = och_arc.lock().unwrap().state;
                if state != ChannelState::OpenStart && state != ChannelState::Recycling {
                    tracing::debug!(
                        ctx = ctx.slot,
                        "out channel can't output itself after virtual connection established"
                    );
                    return Verdict::Runoff;
                }
                let head = format!(
                    "HTTP/1.1 200 Success\r\n\
                     Date: {}\r\n\
                     Cache-Control: private\r\n\
                     Content-Type: application/rpc\r\n\
                     Persistent-Auth: true\r\n\
                     Content-Length: {}\r\n\r\n",
                    rfc1123_now(),
                    OUT_CHANNEL_MAX_LENGTH
                );
                if ctx.stream_out.append(head.as_bytes()).is_err() {
                    tracing::error!("ENOMEM staging out-channel head");
                    return Verdict::Runoff;
                }
                ctx.total_length = OUT_CHANNEL_MAX_LENGTH + head.len() as u64;
                for pdu in call.take_output() {
                    if ctx.stream_out.append(&pdu.data).is_err() {
                        tracing::error!("ENOMEM staging out-channel pdus");
                        return Verdict::Runoff;
                    }
                }
                if self.debug.response_logging > 0 {
                    tracing::info!(ctx = ctx.slot, "200 Success (out channel opened)");
                }
                let mut och = och_arc.lock().unwrap();
                och.call = Some(call);
                och.state = if state == ChannelState::OpenStart {
                    ChannelState::WaitInChannel
                } else {
                    ChannelState::WaitRecycled
                };
                drop(och);
                ctx.bytes_rw = 0;
                ctx.reset_write_window();
                ctx.sched_state = SchedState::WrRep;
                Verdict::Loop
            }
            ChannelRef::In(ich_arc) => {
                let cookie = ich_arc.lock().unwrap().connection_cookie.clone();
                let Some(vr) = self.registry().get(&ctx.host, ctx.port, &cookie) else {
                    tracing::debug!(ctx = ctx.slot, "cannot find virtual connection in hash table");
                    return Verdict::Runoff;
                };
                let st = vr.lock();
                let bound_here = st.ctx_in.as_ref().map(|s| s.slot) == Some(ctx.slot)
                    || st.ctx_in_succ.as_ref().map(|s| s.slot) == Some(ctx.slot);
                let out_pair = st.ctx_out.as_ref().map(|o| (o.channel.clone(), o.slot));
                let Some((out_arc, out_slot)) = out_pair else {
                    tracing::debug!(ctx = ctx.slot, "missing out channel in virtual connection");
                    return Verdict::Runoff;
                };
                if !bound_here {
                    tracing::debug!(ctx = ctx.slot, "missing out channel in virtual connection");
                    return Verdict::Runoff;
                }
                let mut och = out_arc.lock().unwrap();
                if och.obsolete {
                    drop(och);
                    drop(st);
                    // Stash on the IN channel for the successor to drain.
                    let mut ich = ich_arc.lock().unwrap();
                    ich.queue.extend(call.take_output());
                    return Verdict::Cont;
                }
                och.queue.extend(call.take_output());
                drop(och);
                drop(st);
                self.sched().signal(out_slot);
                Verdict::Cont
            }
            ChannelRef::None => Verdict::Runoff,
        }
    }

    // ------------------------------------------------------------------
    // WRREP
    // ------------------------------------------------------------------

    fn out_channel_opened(&self, ctx: &HttpContext) -> Option<Arc<Mutex<RpcOutChannel>>> {
        match &ctx.channel {
            ChannelRef::Out(arc) if arc.lock().unwrap().state == ChannelState::Opened => {
                Some(arc.clone())
            }
            _ => None,
        }
    }

    fn step_wrrep(&self, ctx: &mut HttpContext) -> Verdict {
        if ctx.write_src == WriteSource::None {
            if let Err(v) = self.fill_write_window(ctx) {
                return v;
            }
        }

        let mut remaining = ctx.write_buf.len() - ctx.write_offset;
        let queue_src = ctx.write_src == WriteSource::OutQueue;
        if queue_src {
            if let Some(och_arc) = self.out_channel_opened(ctx) {
                let window = och_arc.lock().unwrap().window();
                if window < WINDOW_FLOOR {
                    return Verdict::Idle;
                }
                remaining = remaining.min(window as usize);
            }
        }

        let off = ctx.write_offset;
        self.debug.dump_write(
            ctx.connection.peer,
            ctx.connection.local,
            &ctx.write_buf[off..off + remaining],
        );
        match ctx.connection.write(&ctx.write_buf[off..off + remaining]) {
            IoOutcome::Closed => {
                tracing::debug!(ctx = ctx.slot, "connection lost");
                Verdict::Runoff
            }
            IoOutcome::NotReady => {
                if ctx.connection.last_activity.elapsed() < self.timeout() {
                    Verdict::PollWrite
                } else {
                    tracing::debug!(ctx = ctx.slot, "timeout writing reply");
                    Verdict::Runoff
                }
            }
            IoOutcome::Failed => {
                tracing::debug!(ctx = ctx.slot, "connection lost");
                Verdict::Runoff
            }
            IoOutcome::Done(n) => {
                ctx.connection.last_activity = Instant::now();
                ctx.write_offset += n;
                ctx.bytes_rw += n as u64;
                if queue_src && !ctx.write_is_rts {
                    if let Some(och_arc) = self.out_channel_opened(ctx) {
                        och_arc.lock().unwrap().account_sent(n as u32);
                    }
                }
                if ctx.write_offset < ctx.write_buf.len() {
                    return Verdict::Cont;
                }
                self.finish_write(ctx)
            }
        }
    }

    /// Picks the next write window: the delegated handler's stream, the OUT
    /// channel's PDU queue, or the out-stream. Err is an early verdict.
    fn fill_write_window(&self, ctx: &mut HttpContext) -> Result<(), Verdict> {
        if ctx.delegation.is_some() {
            let retrieve = {
                let d = ctx.delegation.as_mut().unwrap();
                let handler = d.handler.clone();
                handler.retrieve_response(&mut d.session, &mut ctx.stream_out)
            };
            match retrieve {
                Retrieve::Error => return Err(self.respond_error(ctx, HttpStatus::BAD_REQUEST)),
                Retrieve::Timeout => {
                    tracing::debug!(ctx = ctx.slot, "handler upstream timeout");
                    return Err(self.respond_error(ctx, HttpStatus::FCGI_TIMEOUT));
                }
                Retrieve::None => return Err(Verdict::Cont),
                Retrieve::Wait => {
                    ctx.sched_state = SchedState::Wait;
                    return Err(Verdict::Idle);
                }
                Retrieve::Write | Retrieve::Done => {
                    if ctx.stream_out.total_unread() == 0 {
                        return Err(if ctx.close_after_reply {
                            Verdict::Runoff
                        } else {
                            ctx.request.clear();
                            self.release_delegation(ctx);
                            ctx.stream_out.clear();
                            ctx.sched_state = SchedState::RdHead;
                            Verdict::Cont
                        });
                    }
                }
            }
        }

        if let Some(och_arc) = self.out_channel_opened(ctx) {
            // The queue is shared with the IN context and the async reply
            // path; the borrow pins the pairing while we pop.
            let cookie = och_arc.lock().unwrap().connection_cookie.clone();
            let Some(_vr) = self.registry().get(&ctx.host, ctx.port, &cookie) else {
                tracing::debug!(ctx = ctx.slot, "virtual connection error in hash table");
                return Err(Verdict::Runoff);
            };
            let mut och = och_arc.lock().unwrap();
            match och.queue.pop() {
                Some(pdu) => {
                    ctx.write_buf = pdu.data;
                    ctx.write_offset = 0;
                    ctx.write_is_rts = pdu.is_rts;
                    ctx.write_src = WriteSource::OutQueue;
                    Ok(())
                }
                None => {
                    drop(och);
                    ctx.sched_state = SchedState::Wait;
                    Err(Verdict::Idle)
                }
            }
        } else {
            if ctx.stream_out.read_block_into(&mut ctx.write_buf) {
                ctx.write_offset = 0;
                ctx.write_is_rts = false;
                ctx.write_src = WriteSource::Stream;
                Ok(())
            } else {
                Err(self.finish_write(ctx))
            }
        }
    }

    /// One write window fully drained: pull the next one or decide what the
    /// context does next.
    fn finish_write(&self, ctx: &mut HttpContext) -> Verdict {
        let was_queue = ctx.write_src == WriteSource::OutQueue;
        ctx.reset_write_window();

        if was_queue {
            if let Some(och_arc) = self.out_channel_opened(ctx) {
                let cookie = och_arc.lock().unwrap().connection_cookie.clone();
                let Some(_vr) = self.registry().get(&ctx.host, ctx.port, &cookie) else {
                    tracing::debug!(ctx = ctx.slot, "virtual connection error in hash table");
                    return Verdict::Runoff;
                };
                let mut och = och_arc.lock().unwrap();
                if let Some(pdu) = och.queue.pop() {
                    ctx.write_buf = pdu.data;
                    ctx.write_offset = 0;
                    ctx.write_is_rts = pdu.is_rts;
                    ctx.write_src = WriteSource::OutQueue;
                } else if recycling_due(ctx.total_length, ctx.bytes_rw, och.obsolete) {
                    // Near the response budget: ask the client for a
                    // replacement channel.
                    if let Some(call) = och.call.as_mut() {
                        if call.out_r2_a2() {
                            let pdus = call.take_output();
                            och.queue.extend(pdus);
                            och.obsolete = true;
                        }
                    }
                } else {
                    ctx.sched_state = SchedState::Wait;
                }
                return Verdict::Cont;
            }
            // The channel left OPENED under us; treat like a plain drain.
        }

        if ctx.stream_out.read_block_into(&mut ctx.write_buf) {
            ctx.write_offset = 0;
            ctx.write_is_rts = false;
            ctx.write_src = WriteSource::Stream;
            return Verdict::Cont;
        }

        let waiting_out = matches!(&ctx.channel, ChannelRef::Out(arc) if {
            let st = arc.lock().unwrap().state;
            st == ChannelState::WaitInChannel || st == ChannelState::WaitRecycled
        });
        if waiting_out {
            // Response head is out; now wait for the IN channel to pair up.
            ctx.sched_state = SchedState::Wait;
        } else if ctx.delegation.is_some() {
            ctx.stream_out.clear();
            return Verdict::Cont;
        } else {
            if ctx.close_after_reply {
                return Verdict::Runoff;
            }
            ctx.request.clear();
            ctx.sched_state = SchedState::RdHead;
        }
        ctx.stream_out.clear();
        Verdict::Cont
    }

    // ------------------------------------------------------------------
    // WAIT
    // ------------------------------------------------------------------

    fn step_wait(&self, ctx: &mut HttpContext) -> Verdict {
        if ctx.delegation.is_some() {
            // Suspended producer: poll it again through the WRREP path.
            ctx.sched_state = SchedState::WrRep;
            return Verdict::Idle;
        }
        let ChannelRef::Out(och_arc) = ctx.channel.clone() else {
            return Verdict::Idle;
        };
        let state = och_arc.lock().unwrap().state;
        match state {
            ChannelState::WaitInChannel => self.wait_in_channel(ctx, &och_arc),
            ChannelState::WaitRecycled => self.wait_recycled(ctx, &och_arc),
            ChannelState::Recycled => Verdict::Runoff,
            _ => {
                // Live channel at rest: first see whether work arrived.
                if !och_arc.lock().unwrap().queue.is_empty() {
                    ctx.sched_state = SchedState::WrRep;
                    return Verdict::Loop;
                }
                if !ctx.connection.peer_alive() {
                    tracing::debug!(ctx = ctx.slot, "connection lost");
                    return Verdict::Runoff;
                }
                let keepalive = och_arc.lock().unwrap().client_keepalive;
                if keepalive.is_zero()
                    || ctx.connection.last_activity.elapsed() < keepalive / 2
                {
                    return Verdict::Idle;
                }
                // Keepalive due: emit a PING through the retained call. The
                // borrow pins the pairing while the queue is touched.
                let cookie = och_arc.lock().unwrap().connection_cookie.clone();
                let _vr = self.registry().get(&ctx.host, ctx.port, &cookie);
                let mut och = och_arc.lock().unwrap();
                let pinged = och.call.as_mut().map(|c| c.ping()).unwrap_or(false);
                if !pinged {
                    return Verdict::Idle;
                }
                let pdus = och.call.as_mut().unwrap().take_output();
                och.queue.extend(pdus);
                drop(och);
                ctx.sched_state = SchedState::WrRep;
                Verdict::Loop
            }
        }
    }

    fn wait_in_channel(
        &self,
        ctx: &mut HttpContext,
        och_arc: &Arc<Mutex<RpcOutChannel>>,
    ) -> Verdict {
        let cookie = och_arc.lock().unwrap().connection_cookie.clone();
        if let Some(vr) = self.registry().get(&ctx.host, ctx.port, &cookie) {
            let st = vr.lock();
            let me_out = st.ctx_out.as_ref().map(|s| s.slot) == Some(ctx.slot);
            let in_arc = st.ctx_in.as_ref().map(|s| s.channel.clone());
            if me_out {
                if let Some(in_arc) = in_arc {
                    let mut och = och_arc.lock().unwrap();
                    {
                        let mut ich = in_arc.lock().unwrap();
                        ich.available_window = och.window_size;
                        ich.bytes_received = 0;
                        och.client_keepalive = ich.client_keepalive;
                    }
                    let window_size = och.window_size;
                    let ok = och
                        .call
                        .as_mut()
                        .map(|c| c.conn_c2(window_size))
                        .unwrap_or(false);
                    if !ok {
                        drop(och);
                        drop(st);
                        tracing::debug!(ctx = ctx.slot, "fail to set up conn/c2");
                        return Verdict::Runoff;
                    }
                    let pdus = och.call.as_mut().unwrap().take_output();
                    och.queue.extend(pdus);
                    och.state = ChannelState::Opened;
                    drop(och);
                    drop(st);
                    ctx.sched_state = SchedState::WrRep;
                    return Verdict::Loop;
                }
            }
        }
        if ctx.connection.last_activity.elapsed() < OUT_CHANNEL_MAX_WAIT {
            Verdict::Idle
        } else {
            tracing::debug!(
                ctx = ctx.slot,
                "no corresponding in channel within maximum waiting interval"
            );
            Verdict::Runoff
        }
    }

    fn wait_recycled(
        &self,
        ctx: &mut HttpContext,
        och_arc: &Arc<Mutex<RpcOutChannel>>,
    ) -> Verdict {
        let cookie = och_arc.lock().unwrap().connection_cookie.clone();
        if let Some(vr) = self.registry().get(&ctx.host, ctx.port, &cookie) {
            let st = vr.lock();
            let me_out = st.ctx_out.as_ref().map(|s| s.slot) == Some(ctx.slot);
            let in_arc = st.ctx_in.as_ref().map(|s| s.channel.clone());
            if me_out {
                if let Some(in_arc) = in_arc {
                    let mut och = och_arc.lock().unwrap();
                    let mut ich = in_arc.lock().unwrap();
                    och.client_keepalive = ich.client_keepalive;
                    och.state = ChannelState::Opened;
                    // The predecessor's backlog goes out first.
                    och.queue.append(&mut ich.queue);
                    let empty = och.queue.is_empty();
                    drop(ich);
                    drop(och);
                    drop(st);
                    ctx.sched_state = if empty {
                        SchedState::Wait
                    } else {
                        SchedState::WrRep
                    };
                    return Verdict::Loop;
                }
            }
        }
        if ctx.connection.last_activity.elapsed() < OUT_CHANNEL_MAX_WAIT {
            Verdict::Idle
        } else {
            tracing::debug!(
                ctx = ctx.slot,
                "channel not recycled within maximum waiting interval"
            );
            Verdict::Runoff
        }
    }
}
