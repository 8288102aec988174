use crate::codec;
use crate::config::Settings;
use crate::message::{MessageContext, MessagePhase};
use crate::rules::should_rewrite;
use std::fmt;
use std::sync::Arc;

pub const FROM_HEADER: &str = "From";
pub const ORIGINAL_FROM_HEADER: &str = "X-Original-From";

/// Header mutation produced by the rewrite pass. The protocol layer turns
/// these into milter modification commands; no I/O happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    /// Replace occurrence `index` (1-based, per name) with `value`.
    Replace {
        name: String,
        index: u32,
        value: String,
    },
    /// Append a new header.
    Insert { name: String, value: String },
    /// Delete occurrence `index` (1-based, per name).
    Delete { name: String, index: u32 },
}

/// Error raised when a From header value cannot be parsed into mailboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// The value contains no mailbox at all.
    Empty,
    /// An angle-bracket address is never closed.
    UnbalancedAngleBrackets,
    /// An angle-bracket address with nothing inside.
    EmptyAddress,
}

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressParseError::Empty => write!(f, "header value contains no mailbox"),
            AddressParseError::UnbalancedAngleBrackets => {
                write!(f, "unterminated angle-bracket address")
            }
            AddressParseError::EmptyAddress => write!(f, "empty angle-bracket address"),
        }
    }
}

impl std::error::Error for AddressParseError {}

/// Applies the forward and reverse From rewrites to one message's headers.
///
/// Forward stashes the original From value in `X-Original-From` and replaces
/// every From address with an encoded alias under the configured domain.
/// Reverse restores the stashed value byte-for-byte and removes the stash
/// header; it is keyed purely on the stash header being present, so a
/// relayed message is always restored regardless of the requirement rules.
pub struct RewriteEngine {
    settings: Arc<Settings>,
}

impl RewriteEngine {
    pub fn new(settings: Arc<Settings>) -> Self {
        RewriteEngine { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run once per message at the end-of-headers transition. Records the
    /// decision on the context and returns the mutations to apply.
    ///
    /// Codec and parse failures are absorbed here: the message passes
    /// through unmodified and a diagnostic is logged.
    pub fn evaluate(&self, ctx: &mut MessageContext) -> Vec<HeaderAction> {
        ctx.phase = MessagePhase::Decided;

        let stashed = ctx.first(ORIGINAL_FROM_HEADER).map(|h| h.value.clone());
        if let Some(restored) = stashed {
            ctx.rewrite_decision = Some(false);
            if !self.settings.reverse {
                // Already rewritten upstream; never stash twice.
                log::debug!("stash header present and reverse disabled, passing through");
                return Vec::new();
            }
            log::debug!("restoring From header from {}", ORIGINAL_FROM_HEADER);
            let mut actions = Vec::with_capacity(2);
            if ctx.contains(FROM_HEADER) {
                actions.push(HeaderAction::Replace {
                    name: FROM_HEADER.to_string(),
                    index: 1,
                    value: restored,
                });
            } else {
                actions.push(HeaderAction::Insert {
                    name: FROM_HEADER.to_string(),
                    value: restored,
                });
            }
            actions.push(HeaderAction::Delete {
                name: ORIGINAL_FROM_HEADER.to_string(),
                index: 1,
            });
            return actions;
        }

        if !self.settings.forward {
            ctx.rewrite_decision = Some(false);
            return Vec::new();
        }

        let decision = should_rewrite(&self.settings.require, &ctx.headers);
        ctx.rewrite_decision = Some(decision);
        if !decision {
            log::debug!("rewrite requirements not met, passing through");
            return Vec::new();
        }

        let Some(from) = ctx.first(FROM_HEADER) else {
            log::debug!("no From header, passing through");
            return Vec::new();
        };
        let Some(domain) = self.settings.domain.as_deref() else {
            // Validated at startup; only reachable in hand-built settings.
            log::warn!("forward rewrite enabled without a domain, passing through");
            return Vec::new();
        };

        match rewrite_from_value(&from.value, domain, self.settings.quote_char) {
            Ok(replacement) => {
                log::debug!(
                    "replacing From {:?} with {:?}",
                    from.value.trim(),
                    replacement
                );
                vec![
                    HeaderAction::Insert {
                        name: ORIGINAL_FROM_HEADER.to_string(),
                        value: from.value.clone(),
                    },
                    HeaderAction::Replace {
                        name: FROM_HEADER.to_string(),
                        index: 1,
                        value: replacement,
                    },
                ]
            }
            Err(e) => {
                log::warn!("From header not rewritable ({}), passing through", e);
                Vec::new()
            }
        }
    }
}

/// Rewrite every mailbox in a From value, preserving display names and
/// joining the results with `, `.
pub fn rewrite_from_value(
    value: &str,
    domain: &str,
    quote: char,
) -> Result<String, AddressParseError> {
    let mailboxes: Vec<&str> = split_mailboxes(value)
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if mailboxes.is_empty() {
        return Err(AddressParseError::Empty);
    }

    let rewritten = mailboxes
        .into_iter()
        .map(|mailbox| rewrite_mailbox(mailbox, domain, quote))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rewritten.join(", "))
}

/// Split a From value into top-level mailbox segments. Commas inside quoted
/// strings, comments, and angle-bracket sections do not split.
fn split_mailboxes(value: &str) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut comment_depth = 0u32;
    let mut in_angle = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' if comment_depth == 0 => in_quotes = !in_quotes,
            b'(' if !in_quotes => comment_depth += 1,
            b')' if !in_quotes && comment_depth > 0 => comment_depth -= 1,
            b'<' if !in_quotes && comment_depth == 0 => in_angle = true,
            b'>' if !in_quotes && comment_depth == 0 => in_angle = false,
            b',' if !in_quotes && comment_depth == 0 && !in_angle => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}

/// Rewrite one mailbox. For `Display <addr>` forms the text outside the
/// angle brackets is kept byte-for-byte; for bare addresses the whole
/// trimmed segment is treated as the address.
fn rewrite_mailbox(mailbox: &str, domain: &str, quote: char) -> Result<String, AddressParseError> {
    match find_unquoted(mailbox, b'<') {
        Some(open) => {
            let close = find_unquoted(&mailbox[open..], b'>')
                .map(|rel| open + rel)
                .ok_or(AddressParseError::UnbalancedAngleBrackets)?;
            let address = mailbox[open + 1..close].trim();
            if address.is_empty() {
                return Err(AddressParseError::EmptyAddress);
            }
            let encoded = codec::encode_local_part(address, quote);
            Ok(format!(
                "{}{}@{}{}",
                &mailbox[..open + 1],
                encoded,
                domain,
                &mailbox[close..]
            ))
        }
        None => {
            let encoded = codec::encode_local_part(mailbox, quote);
            Ok(format!("{}@{}", encoded, domain))
        }
    }
}

/// Position of the first occurrence of `target` outside quoted strings and
/// comments.
fn find_unquoted(s: &str, target: u8) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    let mut comment_depth = 0u32;
    for (i, &b) in s.as_bytes().iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' if comment_depth == 0 => in_quotes = !in_quotes,
            b'(' if !in_quotes => comment_depth += 1,
            b')' if !in_quotes && comment_depth > 0 => comment_depth -= 1,
            _ if b == target && !in_quotes && comment_depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}
