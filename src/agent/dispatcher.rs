//! Channel dispatcher: one inbound message in, at most one reply out.
//!
//! Both channels share one [`AgentDeps`]; each channel wraps it in its own
//! [`Dispatcher`] with the channel's trigger policy and reply sender. Every
//! dispatch holds the identity's gate from session lookup to the recorded
//! reply, so events for one identity are handled strictly in arrival order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use tracing::{debug, error, info};

use crate::agent::directives::{self, Directive, FileSink};
use crate::agent::executor::CommandExecutor;
use crate::agent::gate::IdentityGate;
use crate::agent::memory::ConversationMemory;
use crate::agent::routing::{IgnoreReason, Route, TriggerPolicy, route};
use crate::agent::session::{Session, SessionRegistry, SessionTurn};
use crate::agent::stats::AgentStats;
use crate::channels::{Message, ReplySender};
use crate::error::ChannelError;
use crate::files::{AttachmentStager, ScreenCapture, attachment_prompt, expand_home};
use crate::identity::{Identity, IdentityResolver};
use crate::safety::redact_credential;
use crate::store::Role;

/// Delivered when a command produced no text at all.
pub const FALLBACK_REPLY: &str = "⚠️ No response received.";

/// Shared components behind every channel's dispatcher.
pub struct AgentDeps {
    pub resolver: IdentityResolver,
    pub gate: IdentityGate,
    pub sessions: SessionRegistry,
    pub stats: Arc<AgentStats>,
    pub executor: CommandExecutor,
    pub memory: ConversationMemory,
    pub stager: AttachmentStager,
    pub screen: Arc<dyn ScreenCapture>,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Replied { text: String, awaiting: bool },
}

pub struct Dispatcher {
    deps: Arc<AgentDeps>,
    policy: TriggerPolicy,
    sender: Arc<dyn ReplySender>,
}

impl Dispatcher {
    pub fn new(deps: Arc<AgentDeps>, policy: TriggerPolicy, sender: Arc<dyn ReplySender>) -> Self {
        Self {
            deps,
            policy,
            sender,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.sender.name()
    }

    pub async fn dispatch(&self, msg: &Message) -> DispatchOutcome {
        self.dispatch_at(msg, Utc::now()).await
    }

    /// Route and handle `msg` as if it were processed at `now`.
    pub async fn dispatch_at(&self, msg: &Message, now: DateTime<Utc>) -> DispatchOutcome {
        let identity = self.deps.resolver.resolve(&msg.sender_id);
        let _guard = self.deps.gate.acquire(identity.as_str()).await;

        let session_open = self.deps.sessions.is_awaiting(&identity, now);
        match route(msg, &self.policy, session_open) {
            Route::Ignore(reason) => {
                debug!(
                    channel = self.channel_name(),
                    identity = %identity,
                    reason = ?reason,
                    "Message ignored"
                );
                DispatchOutcome::Ignored(reason)
            }
            Route::NewCommand { command } => self.run_command(msg, &identity, &command, now).await,
            Route::Continuation => self.run_continuation(msg, &identity, now).await,
        }
    }

    async fn run_command(
        &self,
        msg: &Message,
        identity: &Identity,
        command: &str,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let deps = &self.deps;
        let day = local_day(now);
        if deps.sessions.reset(identity) {
            info!(identity = %identity, "New command replaced open session");
        }

        let label = if command.is_empty() { "(attachment)" } else { command };
        deps.stats.record(label, now);
        info!(
            channel = self.channel_name(),
            identity = %identity,
            command = %preview(label),
            attachments = msg.attachments.len(),
            "Processing command"
        );

        // History is read before this command is recorded.
        let context = deps.memory.build_context_prefix_on(identity, day).await;
        deps.memory
            .record_turn_on(identity, Role::User, &with_attachment_note(command, msg), day)
            .await;
        self.sender.send_typing(&msg.reply_to).await;

        let (result, original_prompt) = if msg.has_attachments() {
            let (staged, failures) = deps.stager.stage_all(&msg.attachments).await;
            if staged.is_empty() {
                (failures.join("\n"), command.to_string())
            } else {
                let prompt = attachment_prompt(&staged, command);
                let out = deps
                    .executor
                    .execute_prompt(&prompt, command, identity, &context)
                    .await;
                let out = if failures.is_empty() {
                    out
                } else {
                    format!("{}\n\n{out}", failures.join("\n"))
                };
                (out, prompt)
            }
        } else {
            let out = deps.executor.execute_at(command, identity, &context, now).await;
            (out, command.to_string())
        };

        self.finish(msg, identity, &original_prompt, Vec::new(), &result, now)
            .await
    }

    async fn run_continuation(&self, msg: &Message, identity: &Identity, now: DateTime<Utc>) -> DispatchOutcome {
        let deps = &self.deps;
        let day = local_day(now);
        let Some(session) = deps.sessions.take_open(identity, now) else {
            return DispatchOutcome::Ignored(IgnoreReason::NoTrigger);
        };

        let mut reply = msg.text.clone();
        let mut failures = Vec::new();
        if msg.has_attachments() {
            let (staged, staging_failures) = deps.stager.stage_all(&msg.attachments).await;
            failures = staging_failures;
            if !staged.is_empty() {
                let paths: Vec<String> = staged.iter().map(|s| s.path.display().to_string()).collect();
                let note = format!("[Attached files: {}]", paths.join(", "));
                reply = if reply.is_empty() { note } else { format!("{reply}\n{note}") };
            }
        }
        let redacted = redact_credential(&reply).into_owned();
        info!(
            channel = self.channel_name(),
            identity = %identity,
            reply = %preview(&redacted),
            "Clarification answered"
        );

        deps.memory
            .record_turn_on(identity, Role::User, &redacted, day)
            .await;
        self.sender.send_typing(&msg.reply_to).await;

        let prompt = session.followup_prompt(&reply);
        let result = deps
            .executor
            .execute_prompt(&prompt, &msg.text, identity, "")
            .await;
        let result = if failures.is_empty() {
            result
        } else {
            format!("{}\n\n{result}", failures.join("\n"))
        };

        let mut history = session.history;
        history.push(SessionTurn {
            role: Role::Agent,
            content: session.question_context,
        });
        history.push(SessionTurn {
            role: Role::User,
            content: redacted,
        });
        self.finish(msg, identity, &session.original_prompt, history, &result, now)
            .await
    }

    /// Directives, clarification, memory, delivery.
    async fn finish(
        &self,
        msg: &Message,
        identity: &Identity,
        original_prompt: &str,
        history: Vec<SessionTurn>,
        result: &str,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        let deps = &self.deps;
        let (text, question) = directives::extract_clarification(result);

        let sink = ChannelFileSink {
            sender: self.sender.as_ref(),
            screen: deps.screen.as_ref(),
            to: &msg.reply_to,
        };
        let processed = directives::process(&text, &sink).await;
        let body = processed.text.trim().to_string();

        let (reply, awaiting) = match question {
            Some(question) => {
                let reply = if body.is_empty() {
                    format!("❓ {question}")
                } else {
                    format!("{body}\n\n❓ {question}")
                };
                deps.sessions.open(
                    identity,
                    Session::open(original_prompt, history, &reply, now),
                );
                (reply, true)
            }
            None => {
                deps.sessions.reset(identity);
                if body.is_empty() {
                    (FALLBACK_REPLY.to_string(), false)
                } else {
                    (body, false)
                }
            }
        };

        deps.memory
            .record_turn_on(identity, Role::Agent, &reply, local_day(now))
            .await;

        if let Err(e) = self.sender.send_text(&msg.reply_to, &reply).await {
            error!(
                channel = self.channel_name(),
                identity = %identity,
                error = %e,
                "Failed to deliver reply"
            );
        }
        DispatchOutcome::Replied {
            text: reply,
            awaiting,
        }
    }
}

/// Resolves send directives against one reply target.
struct ChannelFileSink<'a> {
    sender: &'a dyn ReplySender,
    screen: &'a dyn ScreenCapture,
    to: &'a str,
}

#[async_trait]
impl FileSink for ChannelFileSink<'_> {
    async fn deliver(&self, directive: &Directive) -> Result<PathBuf, ChannelError> {
        let path = match directive {
            Directive::SendFile(path) => {
                let path = expand_home(path);
                if !path.is_file() {
                    return Err(ChannelError::FileNotFound(path));
                }
                path
            }
            Directive::SendScreenshot(app) => self.screen.capture(app.as_deref()).await?,
        };
        self.sender.send_file(self.to, &path).await?;
        Ok(path)
    }
}

fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn with_attachment_note(command: &str, msg: &Message) -> String {
    if !msg.has_attachments() {
        return command.to_string();
    }
    let names: Vec<&str> = msg.attachments.iter().map(|a| a.name.as_str()).collect();
    let note = format!("[Attached files: {}]", names.join(", "));
    if command.is_empty() {
        note
    } else {
        format!("{command}\n{note}")
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(80) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
