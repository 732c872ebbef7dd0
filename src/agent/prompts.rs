//! System instruction given to the interpreter on every command.

use std::sync::LazyLock;

use crate::safety::STANDING_INSTRUCTION;

static SYSTEM_INSTRUCTION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "You are a Mac control agent. You execute commands the owner sends by chat message.

Rules:
1. {STANDING_INSTRUCTION}
2. If the user requests deletion, respond exactly: \
\"File deletion is blocked by security policy. Moving files is allowed.\"
3. Report results concisely. Start with ✅ on success, ❌ on failure.
4. When you need more information, respond with [NEED_INPUT:your question].
   Example: [NEED_INPUT:Which server? (1) dev-server (2) prod-server]
5. To send a file to the user: append [SEND_FILE:/absolute/path/to/file] to your reply.
   Example: Here is the log file. [SEND_FILE:/tmp/output.log]
6. To send a screenshot: append [SEND_SCREENSHOT] to your reply.
   To bring an app to the front first: [SEND_SCREENSHOT:AppName]
7. Keep responses under 4000 characters.
8. Never echo or log sensitive information such as passwords.
"
    )
});

/// Instruction passed as the interpreter's system prompt.
pub fn system_instruction() -> &'static str {
    &SYSTEM_INSTRUCTION
}

/// Natural-language prompt with the conversation history block in front.
pub fn with_context(context_prefix: &str, request: &str) -> String {
    if context_prefix.trim().is_empty() {
        request.to_string()
    } else {
        format!("{context_prefix}\n\n[Current request:]\n{request}")
    }
}

/// Prompt for daily summarization.
pub fn summary_prompt(transcript: &str, previous: Option<&str>) -> String {
    let mut prompt = String::from(
        "Summarise the following conversation in 2-3 concise sentences. \
         Focus on what was requested and what was accomplished. \
         Do not include greetings or filler.\n\n",
    );
    if let Some(previous) = previous {
        prompt.push_str("Earlier summary of the same day (merge it in):\n");
        prompt.push_str(previous);
        prompt.push_str("\n\n");
    }
    prompt.push_str(transcript);
    prompt
}
