//! In-band control commands and mention hygiene.
//!
//! Agents steer each other with hash-prefixed tokens inside message bodies:
//! `#pause` and `#stop` park the recipient indefinitely, `#done` parks it
//! for a minute and clears its backlog. Parsing is literal and
//! case-sensitive, and anything inside a fenced code block is inert text.
//!
//! The same scanner runs over outgoing responses, because a handler signals
//! completion by embedding `#done` in its own reply.

/// Commands recognised in a message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandScan {
    /// `#pause` or `#stop`: park the agent until an operator resumes it.
    pub pause: bool,
    /// `#done`: park for the cool-down window and clear the backlog.
    pub done: bool,
}

impl CommandScan {
    /// Whether any command was found.
    #[must_use]
    pub fn any(&self) -> bool {
        self.pause || self.done
    }
}

fn is_command_token(token: &str) -> bool {
    matches!(token, "#pause" | "#stop" | "#done")
}

fn is_mention_token(token: &str) -> bool {
    token.len() > 1 && token.starts_with('@')
}

/// Splits content on triple-backtick fences. Even-indexed parts are outside
/// any fence; an unterminated fence swallows the rest of the message.
fn fence_parts(content: &str) -> impl Iterator<Item = (bool, &str)> {
    content
        .split("```")
        .enumerate()
        .map(|(i, part)| (i % 2 == 1, part))
}

/// Scans for command tokens outside fenced code.
#[must_use]
pub fn scan(content: &str) -> CommandScan {
    let mut found = CommandScan::default();
    for (inside, part) in fence_parts(content) {
        if inside {
            continue;
        }
        for token in part.split_whitespace() {
            match token {
                "#pause" | "#stop" => found.pause = true,
                "#done" => found.done = true,
                _ => {}
            }
        }
    }
    found
}

/// Removes tokens matching `drop` from the parts of `content` outside
/// fenced code, keeping fences verbatim. Line structure is preserved;
/// spacing within a rewritten line is normalised to single spaces.
fn remove_tokens(content: &str, drop: impl Fn(&str) -> bool) -> String {
    let mut out = String::with_capacity(content.len());
    for (index, (inside, part)) in fence_parts(content).enumerate() {
        if index > 0 {
            out.push_str("```");
        }
        if inside {
            out.push_str(part);
            continue;
        }
        let mut lines = part.split('\n').peekable();
        while let Some(line) = lines.next() {
            if line.split_whitespace().any(&drop) {
                let kept: Vec<&str> = line.split_whitespace().filter(|t| !drop(t)).collect();
                out.push_str(&kept.join(" "));
            } else {
                out.push_str(line);
            }
            if lines.peek().is_some() {
                out.push('\n');
            }
        }
    }
    out
}

/// Removes recognised command tokens from an outgoing response. Unknown
/// `#tokens` pass through unchanged.
#[must_use]
pub fn strip_commands(content: &str) -> String {
    remove_tokens(content, is_command_token)
}

/// Removes every `@mention` token outside fenced code. Applied to a
/// response that carried `#done`, so the parked agent does not provoke
/// replies it will never read.
#[must_use]
pub fn strip_mentions(content: &str) -> String {
    remove_tokens(content, is_mention_token)
}

/// Removes leading `@agent` tokens naming the agent itself. A reply that
/// opens by mentioning its own author would bounce straight back as a new
/// directed message.
#[must_use]
pub fn strip_leading_self_mentions(content: &str, agent: &str) -> String {
    let mention = format!("@{agent}");
    let mut rest = content.trim_start();
    loop {
        let Some(after) = rest.strip_prefix(&mention) else {
            break;
        };
        // Only strip whole tokens: "@alpha" but not "@alphabet".
        let boundary = after
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == ',' || c == ':');
        if !boundary {
            break;
        }
        rest = after.trim_start_matches([',', ':']).trim_start();
    }
    rest.to_string()
}
