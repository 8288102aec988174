//! Per-connection milter session state machine.
//!
//! The session is pure: [`Session::dispatch`] consumes one decoded frame and
//! returns the replies to send, so the whole protocol conversation can be
//! tested without sockets. The connection loop in `milter.rs` owns the I/O.
//!
//! ```text
//! Negotiating --OPTNEG--> AwaitingMessage --MAIL--> CollectingHeaders
//!       CollectingHeaders --EOH--> Modifying --BODYEOB--> AwaitingMessage
//!       any in-message state --ABORT--> AwaitingMessage
//!       any state --QUIT--> Closed
//! ```

use crate::message::MessageContext;
use crate::protocol::{
    self, Command, ProtocolError, Reply, PROTOCOL_VERSION, SMFIF_ADDHDRS, SMFIF_CHGHDRS,
};
use crate::rewrite::{HeaderAction, RewriteEngine};
use std::sync::Arc;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the MTA's option negotiation.
    Negotiating,
    /// Negotiated, no message transaction open.
    AwaitingMessage,
    /// Envelope seen, accumulating headers.
    CollectingHeaders,
    /// Headers decided and mutations sent; body passes through.
    Modifying,
    /// Quit received; nothing more will be accepted.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Negotiating => "NEGOTIATING",
            SessionState::AwaitingMessage => "AWAITING_MESSAGE",
            SessionState::CollectingHeaders => "COLLECTING_HEADERS",
            SessionState::Modifying => "MODIFYING",
            SessionState::Closed => "CLOSED",
        }
    }
}

/// One milter conversation with the MTA.
///
/// Owns at most one [`MessageContext`] at a time; the context never survives
/// past end-of-message or abort, and negotiated capabilities persist for the
/// connection lifetime.
pub struct Session {
    state: SessionState,
    engine: Arc<RewriteEngine>,
    message: Option<MessageContext>,
    actions_granted: u32,
    peer: String,
    queue_id: Option<String>,
}

impl Session {
    pub fn new(engine: Arc<RewriteEngine>, peer: String) -> Self {
        Session {
            state: SessionState::Negotiating,
            engine,
            message: None,
            actions_granted: 0,
            peer,
            queue_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Action capabilities granted during negotiation.
    pub fn actions_granted(&self) -> u32 {
        self.actions_granted
    }

    /// Handle one frame from the MTA and produce the replies to send back,
    /// in order. A [`ProtocolError`] means this connection must be dropped;
    /// other connections are unaffected.
    pub fn dispatch(
        &mut self,
        command: Command,
        payload: &[u8],
    ) -> Result<Vec<Reply>, ProtocolError> {
        match (self.state, command) {
            (SessionState::Closed, _) => Err(self.unexpected(command)),

            (_, Command::Quit) => {
                log::debug!("{}: quit", self.peer);
                self.message = None;
                self.state = SessionState::Closed;
                Ok(Vec::new())
            }

            (SessionState::Negotiating, Command::OptNeg) => self.negotiate(payload),
            (SessionState::Negotiating, _) => Err(self.unexpected(command)),
            (_, Command::OptNeg) => Err(self.unexpected(command)),

            // Macro frames carry context only and get no reply.
            (_, Command::Macro) => {
                self.remember_queue_id(payload);
                Ok(Vec::new())
            }

            // Abort discards the in-flight message; between messages it is
            // harmless (Postfix sends one after every transaction).
            (_, Command::Abort) => {
                if self.message.take().is_some() {
                    log::debug!("{}: message aborted", self.peer);
                }
                self.queue_id = None;
                self.state = SessionState::AwaitingMessage;
                Ok(Vec::new())
            }

            (SessionState::AwaitingMessage, Command::Connect)
            | (SessionState::AwaitingMessage, Command::Helo)
            | (SessionState::AwaitingMessage, Command::Unknown) => Ok(vec![Reply::Continue]),

            (SessionState::AwaitingMessage, Command::Mail) => {
                self.message = Some(MessageContext::new());
                self.state = SessionState::CollectingHeaders;
                Ok(vec![Reply::Continue])
            }

            (SessionState::CollectingHeaders, Command::Rcpt)
            | (SessionState::CollectingHeaders, Command::Data)
            | (SessionState::CollectingHeaders, Command::Unknown) => Ok(vec![Reply::Continue]),

            (SessionState::CollectingHeaders, Command::Header) => {
                let (name, value) = protocol::parse_header(payload)?;
                self.message
                    .get_or_insert_with(MessageContext::new)
                    .push_header(name, value);
                Ok(vec![Reply::Continue])
            }

            (SessionState::CollectingHeaders, Command::HeaderEnd) => self.end_of_headers(),

            (SessionState::Modifying, Command::Body)
            | (SessionState::Modifying, Command::Unknown) => Ok(vec![Reply::Continue]),

            (SessionState::Modifying, Command::BodyEnd) => {
                log::debug!("{}: end of message{}", self.peer, self.queue_label());
                self.message = None;
                self.queue_id = None;
                self.state = SessionState::AwaitingMessage;
                Ok(vec![Reply::Accept])
            }

            (_, command) => Err(self.unexpected(command)),
        }
    }

    fn unexpected(&self, command: Command) -> ProtocolError {
        ProtocolError::UnexpectedCommand {
            state: self.state,
            command,
        }
    }

    fn negotiate(&mut self, payload: &[u8]) -> Result<Vec<Reply>, ProtocolError> {
        let offer = protocol::parse_optneg(payload)?;
        let required = SMFIF_ADDHDRS | SMFIF_CHGHDRS;
        if offer.actions & required != required {
            return Err(ProtocolError::IncompatibleActions {
                offered: offer.actions,
            });
        }

        self.actions_granted = required;
        self.state = SessionState::AwaitingMessage;
        log::debug!(
            "{}: negotiated protocol version {} actions 0x{:02X}",
            self.peer,
            offer.version.min(PROTOCOL_VERSION),
            required
        );
        Ok(vec![Reply::OptNeg {
            version: offer.version.min(PROTOCOL_VERSION),
            actions: required,
            // Keep every protocol step; header and body frames must flow.
            protocol: 0,
        }])
    }

    fn remember_queue_id(&mut self, payload: &[u8]) {
        for (name, value) in protocol::parse_macros(payload) {
            if name == "i" && !value.is_empty() {
                self.queue_id = Some(value);
            }
        }
    }

    fn end_of_headers(&mut self) -> Result<Vec<Reply>, ProtocolError> {
        let mut ctx = self.message.take().unwrap_or_default();
        let actions = self.engine.evaluate(&mut ctx);
        if !actions.is_empty() {
            log::info!(
                "{}: rewriting From header{}",
                self.peer,
                self.queue_label()
            );
        }
        let mut replies: Vec<Reply> = actions.into_iter().map(reply_for_action).collect();
        replies.push(Reply::Continue);
        self.message = Some(ctx);
        self.state = SessionState::Modifying;
        Ok(replies)
    }

    fn queue_label(&self) -> String {
        match &self.queue_id {
            Some(id) => format!(" (queue id {})", id),
            None => String::new(),
        }
    }
}

fn reply_for_action(action: HeaderAction) -> Reply {
    match action {
        HeaderAction::Replace { name, index, value } => Reply::ChangeHeader { index, name, value },
        HeaderAction::Insert { name, value } => Reply::AddHeader { name, value },
        // An empty value in SMFIR_CHGHEADER deletes the occurrence.
        HeaderAction::Delete { name, index } => Reply::ChangeHeader {
            index,
            name,
            value: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::rules::{RequireRules, RequireValue};

    fn test_engine(require: RequireRules) -> Arc<RewriteEngine> {
        Arc::new(RewriteEngine::new(Arc::new(Settings {
            domain: Some("dmarc.example.com".to_string()),
            milter_port: 1999,
            listen_address: "127.0.0.1".to_string(),
            socket_path: None,
            client_timeout: 300,
            log_level: log::LevelFilter::Warn,
            quote_char: '=',
            forward: true,
            reverse: true,
            require,
        })))
    }

    fn session() -> Session {
        Session::new(test_engine(RequireRules::new()), "test".to_string())
    }

    fn optneg_payload(actions: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(&actions.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload
    }

    fn negotiated_session() -> Session {
        let mut s = session();
        s.dispatch(Command::OptNeg, &optneg_payload(0x1FF)).unwrap();
        s
    }

    #[test]
    fn test_negotiation_claims_header_actions() {
        let mut s = session();
        let replies = s.dispatch(Command::OptNeg, &optneg_payload(0x1FF)).unwrap();
        assert_eq!(
            replies,
            vec![Reply::OptNeg {
                version: 6,
                actions: SMFIF_ADDHDRS | SMFIF_CHGHDRS,
                protocol: 0,
            }]
        );
        assert_eq!(s.state(), SessionState::AwaitingMessage);
    }

    #[test]
    fn test_negotiation_without_header_actions_fails() {
        let mut s = session();
        let err = s
            .dispatch(Command::OptNeg, &optneg_payload(SMFIF_ADDHDRS))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::IncompatibleActions {
                offered: SMFIF_ADDHDRS
            }
        );
    }

    #[test]
    fn test_full_message_flow_with_rewrite() {
        let mut s = Session::new(
            test_engine(
                [(
                    "x-mailman-version".to_string(),
                    RequireValue::Present(true),
                )]
                .into_iter()
                .collect(),
            ),
            "test".to_string(),
        );
        s.dispatch(Command::OptNeg, &optneg_payload(0x1FF)).unwrap();

        assert_eq!(
            s.dispatch(Command::Connect, b"mail.example.org\0").unwrap(),
            vec![Reply::Continue]
        );
        assert_eq!(
            s.dispatch(Command::Helo, b"mail.example.org\0").unwrap(),
            vec![Reply::Continue]
        );
        s.dispatch(Command::Mail, b"<alice@example.org>\0").unwrap();
        assert_eq!(s.state(), SessionState::CollectingHeaders);
        s.dispatch(Command::Rcpt, b"<list@example.net>\0").unwrap();
        s.dispatch(Command::Header, b"X-Mailman-Version\x002.1.15\x00")
            .unwrap();
        s.dispatch(Command::Header, b"From\0Alice <alice@example.org>\0")
            .unwrap();

        let replies = s.dispatch(Command::HeaderEnd, b"").unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::AddHeader {
                    name: "X-Original-From".to_string(),
                    value: "Alice <alice@example.org>".to_string(),
                },
                Reply::ChangeHeader {
                    index: 1,
                    name: "From".to_string(),
                    value: "Alice <alice=40example.org@dmarc.example.com>".to_string(),
                },
                Reply::Continue,
            ]
        );
        assert_eq!(s.state(), SessionState::Modifying);

        assert_eq!(
            s.dispatch(Command::Body, b"hello\r\n").unwrap(),
            vec![Reply::Continue]
        );
        assert_eq!(
            s.dispatch(Command::BodyEnd, b"").unwrap(),
            vec![Reply::Accept]
        );
        assert_eq!(s.state(), SessionState::AwaitingMessage);
    }

    #[test]
    fn test_message_without_trigger_passes_unmodified() {
        let mut s = Session::new(
            test_engine(
                [(
                    "x-mailman-version".to_string(),
                    RequireValue::Present(true),
                )]
                .into_iter()
                .collect(),
            ),
            "test".to_string(),
        );
        s.dispatch(Command::OptNeg, &optneg_payload(0x1FF)).unwrap();
        s.dispatch(Command::Mail, b"<alice@example.org>\0").unwrap();
        s.dispatch(Command::Header, b"From\0Alice <alice@example.org>\0")
            .unwrap();

        let replies = s.dispatch(Command::HeaderEnd, b"").unwrap();
        assert_eq!(replies, vec![Reply::Continue]);
    }

    #[test]
    fn test_state_does_not_leak_across_messages() {
        let mut s = negotiated_session();

        s.dispatch(Command::Mail, b"<a@b>\0").unwrap();
        s.dispatch(Command::Header, b"From\0one@example.org\0")
            .unwrap();
        s.dispatch(Command::HeaderEnd, b"").unwrap();
        s.dispatch(Command::BodyEnd, b"").unwrap();

        // Second message on the same connection sees none of the first.
        s.dispatch(Command::Mail, b"<c@d>\0").unwrap();
        s.dispatch(Command::Header, b"Subject\0no sender\0").unwrap();
        let replies = s.dispatch(Command::HeaderEnd, b"").unwrap();
        assert_eq!(replies, vec![Reply::Continue]);
    }

    #[test]
    fn test_abort_discards_message_state() {
        let mut s = negotiated_session();

        s.dispatch(Command::Mail, b"<a@b>\0").unwrap();
        s.dispatch(Command::Header, b"From\0one@example.org\0")
            .unwrap();
        assert_eq!(s.dispatch(Command::Abort, b"").unwrap(), Vec::new());
        assert_eq!(s.state(), SessionState::AwaitingMessage);

        // The aborted message's headers are gone.
        s.dispatch(Command::Mail, b"<c@d>\0").unwrap();
        let replies = s.dispatch(Command::HeaderEnd, b"").unwrap();
        assert_eq!(replies, vec![Reply::Continue]);
    }

    #[test]
    fn test_out_of_sequence_header_errors() {
        let mut s = negotiated_session();
        let err = s
            .dispatch(Command::Header, b"From\0a@b\0")
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedCommand {
                state: SessionState::AwaitingMessage,
                command: Command::Header,
            }
        );
    }

    #[test]
    fn test_commands_before_negotiation_error() {
        let mut s = session();
        assert!(s.dispatch(Command::Mail, b"<a@b>\0").is_err());
        assert!(s.dispatch(Command::Header, b"From\0a@b\0").is_err());
    }

    #[test]
    fn test_quit_closes_session() {
        let mut s = negotiated_session();
        assert_eq!(s.dispatch(Command::Quit, b"").unwrap(), Vec::new());
        assert!(s.is_closed());
        assert!(s.dispatch(Command::Mail, b"<a@b>\0").is_err());
    }

    #[test]
    fn test_macro_frames_get_no_reply_and_carry_queue_id() {
        let mut s = negotiated_session();
        assert_eq!(
            s.dispatch(Command::Macro, b"Mi\0QID42\0").unwrap(),
            Vec::new()
        );
        assert_eq!(s.queue_id.as_deref(), Some("QID42"));
    }

    #[test]
    fn test_reverse_flow_over_protocol() {
        let mut s = negotiated_session();
        s.dispatch(Command::Mail, b"<b@d>\0").unwrap();
        s.dispatch(
            Command::Header,
            b"From\0Bob <bob=40example.org@dmarc.example.com>\0",
        )
        .unwrap();
        s.dispatch(Command::Header, b"X-Original-From\0Bob <bob@example.org>\0")
            .unwrap();

        let replies = s.dispatch(Command::HeaderEnd, b"").unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::ChangeHeader {
                    index: 1,
                    name: "From".to_string(),
                    value: "Bob <bob@example.org>".to_string(),
                },
                Reply::ChangeHeader {
                    index: 1,
                    name: "X-Original-From".to_string(),
                    value: String::new(),
                },
                Reply::Continue,
            ]
        );
    }
}
