//! Line-oriented transcript output.
//!
//! The terminal cannot redraw earlier lines, so each snapshot is turned into
//! only what is new since the last one: whole user messages, and the tail of
//! any assistant reply that grew.

use std::collections::{HashMap, HashSet};

use convo_sync::{Message, Role};

#[derive(Debug)]
struct Shown {
    /// Characters of `content` already written.
    chars: usize,
    complete: bool,
    /// Content of a provisional entry, to recognise its echo.
    provisional: Option<String>,
}

#[derive(Debug, Default)]
pub struct Transcript {
    shown: HashMap<String, Shown>,
    /// A reply is mid-line and needs a newline before anything else prints.
    open_line: Option<String>,
}

impl Transcript {
    pub fn reset(&mut self) {
        self.shown.clear();
        self.open_line = None;
    }

    /// Text to print for `messages`, given everything printed so far.
    pub fn render(&mut self, messages: &[Message]) -> String {
        let present: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();

        // Provisional entries replaced by their echo since the last render.
        let mut resolved: Vec<String> = Vec::new();
        self.shown.retain(|id, shown| {
            if present.contains(id.as_str()) {
                return true;
            }
            if let Some(content) = shown.provisional.take() {
                resolved.push(content);
            }
            false
        });

        let mut out = String::new();
        for message in messages {
            if let Some(shown) = self.shown.get_mut(&message.message_id) {
                if message.role == Role::Assistant && !shown.complete {
                    let tail: String = message.content.chars().skip(shown.chars).collect();
                    if !tail.is_empty() {
                        continue_line(&mut self.open_line, &mut out, &message.message_id);
                        out.push_str(&tail);
                        shown.chars += tail.chars().count();
                    }
                    if message.is_complete {
                        continue_line(&mut self.open_line, &mut out, &message.message_id);
                        out.push('\n');
                        self.open_line = None;
                        shown.complete = true;
                    }
                }
                continue;
            }

            if message.role == Role::User && !message.is_provisional() {
                if let Some(pos) = resolved.iter().position(|c| *c == message.content) {
                    resolved.remove(pos);
                    self.shown.insert(message.message_id.clone(), Shown::done(message));
                    continue;
                }
            }

            break_line(&mut self.open_line, &mut out);
            match message.role {
                Role::User => {
                    out.push_str(&format!("you> {}\n", message.content));
                    let mut shown = Shown::done(message);
                    if message.is_provisional() {
                        shown.provisional = Some(message.content.clone());
                    }
                    self.shown.insert(message.message_id.clone(), shown);
                }
                Role::Assistant => {
                    out.push_str(&format!("assistant> {}", message.content));
                    if message.is_complete {
                        out.push('\n');
                    } else {
                        self.open_line = Some(message.message_id.clone());
                    }
                    self.shown.insert(
                        message.message_id.clone(),
                        Shown {
                            chars: message.content.chars().count(),
                            complete: message.is_complete,
                            provisional: None,
                        },
                    );
                }
            }
        }
        out
    }
}

/// Resume writing reply `id`, re-printing its prefix if another line
/// interrupted it.
fn continue_line(open_line: &mut Option<String>, out: &mut String, id: &str) {
    if open_line.as_deref() == Some(id) {
        return;
    }
    break_line(open_line, out);
    out.push_str("assistant> ...");
    *open_line = Some(id.to_string());
}

fn break_line(open_line: &mut Option<String>, out: &mut String) {
    if open_line.take().is_some() {
        out.push('\n');
    }
}

impl Shown {
    fn done(message: &Message) -> Self {
        Self {
            chars: message.content.chars().count(),
            complete: true,
            provisional: None,
        }
    }
}
