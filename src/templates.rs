//! User-facing message templates, kept in one place so the channel handlers
//! stay free of copy.

pub const START: &str = "🤖 *Switchboard*\n\n\
Hi! I'm an AI assistant.\n\n\
*How to use:*\n\
• *Private chat:* just send a message\n\
• *Group chat:* mention me @{bot_username} or reply to one of my messages\n\n\
*Commands:*\n\
/start - About this bot\n\
/help - Help\n\
/clear - Reset the conversation\n\
/export <description> - Build a spreadsheet from a description\n\
/stats - Statistics (admin only)";

pub const HELP: &str = "📚 *Help*\n\n\
*Things to try:*\n\
• \"Explain what an index fund is\"\n\
• \"Summarise this\" (reply to a message)\n\
• Send a photo with a question as the caption\n\
• /export monthly budget for a family of four\n\n\
I remember the conversation, /clear starts fresh.\n\n\
*Commands:*\n\
/start - About\n\
/help - Help\n\
/clear - Reset\n\
/export - Spreadsheet export\n\
/stats - Statistics (admin)";

pub const HISTORY_CLEARED: &str = "✅ Conversation reset.";
pub const ADMIN_ONLY: &str = "❌ This command is admin-only.";
pub const ANALYZING_IMAGE: &str = "📷 Analyzing image...";
pub const BUILDING_EXPORT: &str = "📊 Building your spreadsheet...";
pub const EXPORT_USAGE: &str =
    "Usage: /export <description of the data>\nExample: /export weekly meal plan with costs";
pub const SCHEMA_ERROR: &str =
    "⚠️ I couldn't turn the model's answer into a spreadsheet. Try rephrasing the request.";

pub fn rate_limit_cooldown(remaining_secs: u64) -> String {
    format!("⏱️ Too fast! Wait {} more second(s).", remaining_secs)
}

pub fn rate_limit_burst(max_per_minute: usize) -> String {
    format!("⏱️ Too many requests! Max {}/minute.", max_per_minute)
}

pub fn upstream_error(excerpt: &str) -> String {
    format!("❌ Sorry, something went wrong: {}", excerpt)
}

pub fn stats(
    total_conversations: u64,
    total_turns: u64,
    active_conversations: u64,
    chat_model: &str,
    cooldown_secs: u64,
    max_per_minute: usize,
) -> String {
    format!(
        "📊 *Bot Statistics*\n\n\
         👥 Conversations: {}\n\
         💬 Turns stored: {}\n\
         ✅ Active: {}\n\
         🤖 Model: {}\n\
         ⏱️ Rate limit: {}s / {} req/min",
        total_conversations, total_turns, active_conversations, chat_model, cooldown_secs,
        max_per_minute
    )
}
