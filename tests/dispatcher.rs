//! Integration tests for the dispatcher.
//!
//! Each test wires the real components (routing, sessions, executor, memory on
//! an in-memory libSQL database) to a scripted interpreter and a recording
//! reply sender, then drives messages through `Dispatcher::dispatch_at`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

use relay_agent::agent::{
    AgentDeps, AgentStats, CommandExecutor, ConversationMemory, DispatchOutcome, Dispatcher,
    ExecutorConfig, FALLBACK_REPLY, IdentityGate, IgnoreReason, SessionRegistry, TriggerPolicy,
};
use relay_agent::channels::{Attachment, Message, ReplySender, SourceChannel};
use relay_agent::error::{ChannelError, InterpreterError};
use relay_agent::files::{AttachmentStager, ScreenCapture};
use relay_agent::identity::{Identity, IdentityResolver};
use relay_agent::interpreter::{Interpreter, InterpreterRequest};
use relay_agent::safety::{BLOCK_RESPONSE, DeletionGuard};
use relay_agent::store::{LibSqlBackend, MemoryStore, Role};
use relay_agent::tools::ShellRunner;

const STORE_HANDLE: &str = "+15550001111";
const BOT_USER: &str = "42";

/// Interpreter stub: replies from a queue ("ok" once drained) and records prompts.
#[derive(Default)]
struct ScriptedInterpreter {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedInterpreter {
    fn with_replies(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: InterpreterRequest<'_>) -> Result<String, InterpreterError> {
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| "ok".to_string()))
    }
}

/// Records every text and file sent.
#[derive(Default)]
struct RecordingSender {
    texts: Mutex<Vec<(String, String)>>,
    files: Mutex<Vec<(String, PathBuf)>>,
}

impl RecordingSender {
    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl ReplySender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        self.texts.lock().unwrap().push((to.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_file(&self, to: &str, path: &Path) -> Result<(), ChannelError> {
        self.files.lock().unwrap().push((to.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// Writes a placeholder PNG instead of capturing the screen.
struct FakeScreen {
    dir: PathBuf,
}

#[async_trait]
impl ScreenCapture for FakeScreen {
    async fn capture(&self, _app: Option<&str>) -> Result<PathBuf, ChannelError> {
        let path = self.dir.join("screenshot_test.png");
        std::fs::write(&path, b"png").map_err(|e| ChannelError::SendFailed {
            name: "screenshot".into(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }
}

struct Harness {
    deps: Arc<AgentDeps>,
    interpreter: Arc<ScriptedInterpreter>,
    store_sender: Arc<RecordingSender>,
    bot_sender: Arc<RecordingSender>,
    store: Dispatcher,
    bot: Dispatcher,
    dir: TempDir,
}

async fn harness(interpreter: ScriptedInterpreter) -> Harness {
    harness_with_aliases(interpreter, HashMap::new()).await
}

async fn harness_with_aliases(interpreter: ScriptedInterpreter, aliases: HashMap<String, String>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let interpreter = Arc::new(interpreter);
    let db: Arc<dyn MemoryStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let stats = Arc::new(AgentStats::started_at(at(0)));

    let executor = CommandExecutor::new(
        interpreter.clone(),
        ShellRunner::new().with_timeout(Duration::from_secs(5)),
        DeletionGuard::default_rules(),
        Arc::clone(&stats),
        ExecutorConfig::default(),
    );
    let memory = ConversationMemory::new(db, interpreter.clone(), Duration::from_secs(5));

    let deps = Arc::new(AgentDeps {
        resolver: IdentityResolver::new(aliases),
        gate: IdentityGate::new(),
        sessions: SessionRegistry::new(),
        stats,
        executor,
        memory,
        stager: AttachmentStager::new(dir.path().join("inbox"), 100, 20),
        screen: Arc::new(FakeScreen {
            dir: dir.path().to_path_buf(),
        }),
    });

    let store_sender = Arc::new(RecordingSender::default());
    let bot_sender = Arc::new(RecordingSender::default());
    let store = Dispatcher::new(
        Arc::clone(&deps),
        TriggerPolicy::Prefix("/c ".into()),
        store_sender.clone(),
    );
    let bot = Dispatcher::new(
        Arc::clone(&deps),
        TriggerPolicy::AlwaysOn("/c ".into()),
        bot_sender.clone(),
    );

    Harness {
        deps,
        interpreter,
        store_sender,
        bot_sender,
        store,
        bot,
        dir,
    }
}

/// 2026-03-01 12:00:00 UTC plus `secs`.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

fn store_msg(text: &str) -> Message {
    Message::new(SourceChannel::StorePoll, STORE_HANDLE, text)
}

fn bot_msg(text: &str) -> Message {
    Message::new(SourceChannel::BotApi, BOT_USER, text)
}

fn replied(outcome: &DispatchOutcome) -> (&str, bool) {
    match outcome {
        DispatchOutcome::Replied { text, awaiting } => (text.as_str(), *awaiting),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn store_noise_is_ignored_without_side_effects() {
    let h = harness(ScriptedInterpreter::default()).await;

    let outcome = h.store.dispatch_at(&store_msg("see you at 5"), at(0)).await;

    assert_eq!(outcome, DispatchOutcome::Ignored(IgnoreReason::NoTrigger));
    assert!(h.store_sender.texts().is_empty());
    assert!(h.interpreter.prompts().is_empty());
    assert_eq!(h.deps.stats.processed(), 0);
}

#[tokio::test]
async fn self_echo_needs_explicit_trigger() {
    let h = harness(ScriptedInterpreter::with_replies(&["echo handled"])).await;

    let echo = store_msg("❓ Which folder?").with_self_echo(true);
    assert_eq!(
        h.store.dispatch_at(&echo, at(0)).await,
        DispatchOutcome::Ignored(IgnoreReason::SelfEcho)
    );

    let triggered = store_msg("/c list downloads").with_self_echo(true);
    let outcome = h.store.dispatch_at(&triggered, at(1)).await;
    assert_eq!(replied(&outcome), ("echo handled", false));
    assert_eq!(h.store_sender.texts(), vec!["echo handled"]);
}

#[tokio::test]
async fn trigger_only_is_ignored() {
    let h = harness(ScriptedInterpreter::default()).await;
    assert_eq!(
        h.store.dispatch_at(&store_msg("/c"), at(0)).await,
        DispatchOutcome::Ignored(IgnoreReason::EmptyCommand)
    );
    assert!(h.store_sender.texts().is_empty());
}

#[tokio::test]
async fn clarification_answered_within_window_continues_task() {
    let h = harness(ScriptedInterpreter::with_replies(&[
        "[NEED_INPUT:Which folder?]",
        "Sorted Documents.",
    ]))
    .await;

    let first = h.store.dispatch_at(&store_msg("/c sort my files"), at(0)).await;
    assert_eq!(replied(&first), ("❓ Which folder?", true));

    // 4:59 later, no trigger needed.
    let answer = h.store.dispatch_at(&store_msg("Documents"), at(299)).await;
    assert_eq!(replied(&answer), ("Sorted Documents.", false));

    let prompts = h.interpreter.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Original request: sort my files"));
    assert!(prompts[1].contains("The user replied: 'Documents'"));
    assert!(!h.deps.sessions.is_awaiting(&Identity::new(format!("imessage:{STORE_HANDLE}")), at(300)));
}

#[tokio::test]
async fn followup_prompt_carries_the_question_being_answered() {
    let h = harness(ScriptedInterpreter::with_replies(&[
        "Found two reports.[NEED_INPUT:Which folder, Documents or Desktop?]",
        "Moved.",
    ]))
    .await;

    let first = h.store.dispatch_at(&store_msg("/c sort my files"), at(0)).await;
    assert_eq!(
        replied(&first),
        ("Found two reports.\n\n❓ Which folder, Documents or Desktop?", true)
    );
    h.store.dispatch_at(&store_msg("Documents"), at(30)).await;

    let followup = &h.interpreter.prompts()[1];
    assert!(followup.contains("agent: Found two reports.\n\n❓ Which folder, Documents or Desktop?"));
    let question_at = followup.find("Which folder").unwrap();
    let reply_at = followup.find("The user replied: 'Documents'").unwrap();
    assert!(question_at < reply_at);
}

#[tokio::test]
async fn failed_attachment_on_followup_is_reported() {
    let h = harness(ScriptedInterpreter::with_replies(&[
        "[NEED_INPUT:Which invoice?]",
        "Filed it.",
    ]))
    .await;
    let missing = h.dir.path().join("gone.pdf");

    h.bot.dispatch_at(&bot_msg("file my invoice"), at(0)).await;
    let answer = bot_msg("this one").with_attachments(vec![Attachment::new(&missing)]);
    let outcome = h.bot.dispatch_at(&answer, at(20)).await;

    let (text, awaiting) = replied(&outcome);
    assert!(text.starts_with("⚠️ gone.pdf: Attachment not found"));
    assert!(text.ends_with("Filed it."));
    assert!(!awaiting);
}

#[tokio::test]
async fn expired_session_falls_back_to_routing() {
    let h = harness(ScriptedInterpreter::with_replies(&["[NEED_INPUT:Which folder?]"])).await;

    h.store.dispatch_at(&store_msg("/c sort my files"), at(0)).await;

    // 5:01 later the store channel requires a trigger again.
    let late = h.store.dispatch_at(&store_msg("Documents"), at(301)).await;
    assert_eq!(late, DispatchOutcome::Ignored(IgnoreReason::NoTrigger));
    assert_eq!(h.interpreter.prompts().len(), 1);
}

#[tokio::test]
async fn expired_session_on_bot_becomes_new_command() {
    let h = harness(ScriptedInterpreter::with_replies(&[
        "[NEED_INPUT:Which folder?]",
        "fresh answer",
    ]))
    .await;

    h.bot.dispatch_at(&bot_msg("sort my files"), at(0)).await;
    let late = h.bot.dispatch_at(&bot_msg("Documents"), at(301)).await;

    assert_eq!(replied(&late), ("fresh answer", false));
    let prompts = h.interpreter.prompts();
    assert!(!prompts[1].contains("Original request"));
    assert!(prompts[1].ends_with("Documents"));
    assert_eq!(h.bot_sender.texts(), vec!["❓ Which folder?", "fresh answer"]);
}

#[tokio::test]
async fn explicit_trigger_replaces_open_session() {
    let h = harness(ScriptedInterpreter::with_replies(&["[NEED_INPUT:Which folder?]"])).await;
    let identity = Identity::new(format!("imessage:{STORE_HANDLE}"));

    h.store.dispatch_at(&store_msg("/c sort my files"), at(0)).await;
    assert!(h.deps.sessions.is_awaiting(&identity, at(10)));

    let status = h.store.dispatch_at(&store_msg("/c status"), at(20)).await;
    let (text, awaiting) = replied(&status);
    assert!(text.starts_with("🤖 Agent Status"));
    assert!(text.contains("Commands processed: 2"));
    assert!(!awaiting);
    assert!(!h.deps.sessions.is_awaiting(&identity, at(30)));
}

#[tokio::test]
async fn empty_interpreter_output_sends_fallback() {
    let h = harness(ScriptedInterpreter::with_replies(&["   "])).await;

    let outcome = h.bot.dispatch_at(&bot_msg("anything new?"), at(0)).await;

    assert_eq!(replied(&outcome), (FALLBACK_REPLY, false));
    assert_eq!(h.bot_sender.texts(), vec![FALLBACK_REPLY]);
}

#[tokio::test]
async fn deletion_requests_are_blocked_before_execution() {
    let h = harness(ScriptedInterpreter::default()).await;

    let shell = h.store.dispatch_at(&store_msg("/c !rm -rf ~/Documents"), at(0)).await;
    assert_eq!(replied(&shell).0, BLOCK_RESPONSE);

    let natural = h.bot.dispatch_at(&bot_msg("please delete that file"), at(1)).await;
    assert_eq!(replied(&natural).0, BLOCK_RESPONSE);

    assert!(h.interpreter.prompts().is_empty());
}

#[tokio::test]
async fn shell_passthrough_returns_fenced_output() {
    let h = harness(ScriptedInterpreter::default()).await;

    let outcome = h.store.dispatch_at(&store_msg("/c !echo relay"), at(0)).await;

    let (text, _) = replied(&outcome);
    assert!(text.starts_with("```\n"));
    assert!(text.contains("relay"));
    assert!(h.interpreter.prompts().is_empty());
}

#[tokio::test]
async fn send_directives_deliver_files_in_order() {
    let h = harness(ScriptedInterpreter::default()).await;
    let report = h.dir.path().join("report.txt");
    std::fs::write(&report, "numbers").unwrap();
    let missing = h.dir.path().join("missing.txt");
    h.interpreter.replies.lock().unwrap().push_back(format!(
        "Here you go [SEND_FILE:{}] [SEND_SCREENSHOT] [SEND_FILE:{}]",
        report.display(),
        missing.display()
    ));

    let outcome = h.bot.dispatch_at(&bot_msg("send me the report"), at(0)).await;

    let (text, _) = replied(&outcome);
    assert!(text.starts_with("Here you go 📎 report.txt sent 📸 Screenshot sent ⚠️ missing.txt not sent"));
    let files = h.bot_sender.files.lock().unwrap().clone();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0], (BOT_USER.to_string(), report));
    assert!(files[1].1.ends_with("screenshot_test.png"));
}

#[tokio::test]
async fn attachment_only_message_is_staged_and_described() {
    let h = harness(ScriptedInterpreter::with_replies(&["It is a note."])).await;
    let source = h.dir.path().join("note.txt");
    std::fs::write(&source, "buy milk").unwrap();

    let msg = bot_msg("").with_attachments(vec![Attachment::new(&source)]);
    let outcome = h.bot.dispatch_at(&msg, at(0)).await;

    assert_eq!(replied(&outcome).0, "It is a note.");
    let prompt = &h.interpreter.prompts()[0];
    assert!(prompt.contains("The user sent 1 file(s):"));
    assert!(prompt.contains("[text] note.txt"));
    assert!(prompt.contains("User message: (analyze the file)"));
    assert!(h.dir.path().join("inbox/note.txt").exists());
}

#[tokio::test]
async fn turns_are_recorded_and_fed_back_as_context() {
    let h = harness(ScriptedInterpreter::with_replies(&["It's sunny.", "Take sunglasses."])).await;
    let identity = format!("telegram:{BOT_USER}");

    h.bot.dispatch_at(&bot_msg("weather today?"), at(0)).await;
    h.bot.dispatch_at(&bot_msg("what should I bring?"), at(60)).await;

    let turns = h
        .deps
        .memory
        .store()
        .turns_on(&identity, local_day(at(0)))
        .await
        .unwrap();
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Agent, Role::User, Role::Agent]);
    assert_eq!(turns[1].content, "It's sunny.");

    let second_prompt = &h.interpreter.prompts()[1];
    assert!(second_prompt.contains("It's sunny."));
    assert!(second_prompt.contains("[Current request:]\nwhat should I bring?"));
}

#[tokio::test]
async fn identity_map_shares_session_across_channels() {
    let aliases = HashMap::from([(BOT_USER.to_string(), format!("imessage:{STORE_HANDLE}"))]);
    let h = harness_with_aliases(
        ScriptedInterpreter::with_replies(&["[NEED_INPUT:Which folder?]", "Done."]),
        aliases,
    )
    .await;

    h.store.dispatch_at(&store_msg("/c sort my files"), at(0)).await;
    let answer = h.bot.dispatch_at(&bot_msg("Documents"), at(30)).await;

    assert_eq!(replied(&answer), ("Done.", false));
    assert!(h.interpreter.prompts()[1].contains("Original request: sort my files"));
    assert_eq!(h.bot_sender.texts(), vec!["Done."]);
}

#[tokio::test]
async fn credential_replies_are_redacted_in_memory() {
    let h = harness(ScriptedInterpreter::with_replies(&[
        "[NEED_INPUT:What is the wifi password?]",
        "Connected.",
    ]))
    .await;
    let identity = format!("imessage:{STORE_HANDLE}");

    h.store.dispatch_at(&store_msg("/c join the office wifi"), at(0)).await;
    h.store.dispatch_at(&store_msg("hunter2!pass"), at(10)).await;

    // The interpreter still sees the real answer.
    assert!(h.interpreter.prompts()[1].contains("hunter2!pass"));
    let turns = h
        .deps
        .memory
        .store()
        .turns_on(&identity, local_day(at(0)))
        .await
        .unwrap();
    assert!(turns.iter().all(|t| !t.content.contains("hunter2!pass")));
}

#[tokio::test]
async fn daily_maintenance_is_idempotent() {
    let h = harness(ScriptedInterpreter::with_replies(&["Checked the weather."])).await;
    let day = local_day(at(0));

    h.bot.dispatch_at(&bot_msg("weather today?"), at(0)).await;
    h.interpreter
        .replies
        .lock()
        .unwrap()
        .push_back("Asked about the weather.".to_string());

    let tomorrow = day.succ_opt().unwrap();
    let first = h.deps.memory.run_daily_maintenance_on(tomorrow).await;
    assert_eq!(first.summarized_days, 1);
    assert_eq!(first.archived_turns, 2);

    let second = h.deps.memory.run_daily_maintenance_on(tomorrow).await;
    assert_eq!(second.summarized_days, 0);
    assert_eq!(second.archived_turns, 0);

    let store = h.deps.memory.store();
    let identity = format!("telegram:{BOT_USER}");
    assert!(store.turns_on(&identity, day).await.unwrap().is_empty());
    assert_eq!(store.archived_turns(&identity).await.unwrap().len(), 2);
    assert_eq!(
        store.summary_for(&identity, day).await.unwrap().map(|s| s.summary),
        Some("Asked about the weather.".to_string())
    );
}

#[tokio::test]
async fn same_identity_commands_never_overlap() {
    let h = harness(ScriptedInterpreter::slow(Duration::from_millis(50))).await;
    let bot = Arc::new(h.bot);

    let mut tasks = Vec::new();
    for i in 0..3 {
        let bot = Arc::clone(&bot);
        tasks.push(tokio::spawn(async move {
            bot.dispatch_at(&bot_msg(&format!("task {i}")), at(i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(h.interpreter.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.bot_sender.texts().len(), 3);
}
