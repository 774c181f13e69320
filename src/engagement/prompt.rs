//! 上下文渲染：把会话线程与帖子渲染成发给判定 / 生成服务的文本

use crate::platform::{ConversationThread, Post};

pub const SHOULD_RESPOND_TEMPLATE: &str = "\
You are @{owner}. Decide whether to reply to the latest post in this conversation.

Conversation (oldest first):
{thread}

Latest post from @{author}:
{text}

Answer with exactly one token: RESPOND if a reply adds value, IGNORE if it does not, \
STOP if the conversation should end.";

pub const ACTIONS_TEMPLATE: &str = "\
You are @{owner}, browsing your timeline. For the post below choose any actions worth taking.

{thread}

Post from @{author}:
{text}

List each chosen action on its own line as [LIKE], [RETWEET], [QUOTE] or [REPLY]. \
List nothing if no action fits.";

pub const REPLY_TEMPLATE: &str = "\
You are @{owner}. Write a reply to the latest post in this conversation.

Conversation (oldest first):
{thread}

Reply to @{author}:
{text}

Return only the reply text.";

pub const QUOTE_TEMPLATE: &str = "\
You are @{owner}. Write a short comment to accompany a quote of this post from @{author}:
{text}

Return only the comment text.";

pub const NEW_POST_TEMPLATE: &str = "\
You are @{owner}. Write one new standalone post{topics}.

Recent posts of yours, do not repeat them:
{recent}

Return only the post text.";

/// 线程渲染为多行文本：每行 `@author [id]: text`
pub fn render_thread(thread: &ConversationThread) -> String {
    if thread.is_empty() {
        return "(no prior context)".to_string();
    }
    thread
        .posts()
        .iter()
        .map(render_post)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_post(post: &Post) -> String {
    let mut line = format!("@{} [{}]: {}", post.author_handle, post.id, post.body_text);
    for attachment in &post.attachments {
        match &attachment.description {
            Some(desc) => line.push_str(&format!(" (media: {desc})")),
            None => line.push_str(&format!(" (media: {})", attachment.url)),
        }
    }
    line
}

fn fill(template: &str, owner: &str, post: &Post, thread: &ConversationThread) -> String {
    template
        .replace("{owner}", owner)
        .replace("{thread}", &render_thread(thread))
        .replace("{author}", &post.author_handle)
        .replace("{text}", &post.body_text)
}

pub fn should_respond_prompt(owner: &str, post: &Post, thread: &ConversationThread) -> String {
    fill(SHOULD_RESPOND_TEMPLATE, owner, post, thread)
}

pub fn actions_prompt(owner: &str, post: &Post, thread: &ConversationThread) -> String {
    fill(ACTIONS_TEMPLATE, owner, post, thread)
}

pub fn reply_prompt(owner: &str, post: &Post, thread: &ConversationThread) -> String {
    fill(REPLY_TEMPLATE, owner, post, thread)
}

pub fn quote_prompt(owner: &str, post: &Post) -> String {
    fill(QUOTE_TEMPLATE, owner, post, &ConversationThread::default())
}

pub fn new_post_prompt(owner: &str, topics: &[String], recent: &[Post]) -> String {
    let topics = if topics.is_empty() {
        String::new()
    } else {
        format!(" about one of: {}", topics.join(", "))
    };
    let recent = if recent.is_empty() {
        "(none)".to_string()
    } else {
        recent.iter().map(render_post).collect::<Vec<_>>().join("\n")
    };
    NEW_POST_TEMPLATE
        .replace("{owner}", owner)
        .replace("{topics}", &topics)
        .replace("{recent}", &recent)
}

/// 生成结果去掉首尾空白与成对引号
pub fn clean_generated(text: &str) -> String {
    let trimmed = text.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}
