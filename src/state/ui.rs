//! Basic UI interactions built on session queries.

use serde_json::{json, Value};

use super::interaction::Cancelled;
use super::session::Session;

/// Read a choice index out of a query answer.
///
/// Accepts a number or a numeric string; anything outside `0..count` is
/// rejected.
pub fn parse_choice(value: &Value, count: usize) -> Option<usize> {
    let index = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    let index = usize::try_from(index).ok()?;
    (index < count).then_some(index)
}

/// Ask a multiple choice question and return the index of the answer.
///
/// Malformed answers (only possible with a tampered client) are asked
/// again in a loop.
pub async fn ask_choice(
    session: &Session,
    question: &str,
    answers: &[String],
    leave_question: bool,
) -> Result<usize, Cancelled> {
    loop {
        let value = session
            .query(
                "choice",
                json!({
                    "question": question,
                    "answers": answers,
                    "leave_question": leave_question,
                }),
            )
            .await?;
        match parse_choice(&value, answers.len()) {
            Some(index) => return Ok(index),
            None => {
                tracing::warn!(session = session.id(), %value, "invalid choice, asking again");
            }
        }
    }
}

/// Ask a yes/no question.
pub async fn ask_yes_no(
    session: &Session,
    question: &str,
    leave_question: bool,
) -> Result<bool, Cancelled> {
    let answers = ["Yes".to_string(), "No".to_string()];
    let index = ask_choice(session, question, &answers, leave_question).await?;
    Ok(index == 0)
}

/// Show a link and wait until it is clicked.
pub async fn link(session: &Session, link_text: &str, pre_text: &str) -> Result<(), Cancelled> {
    session
        .query("ui.link", json!({"link_text": link_text, "pre_text": pre_text}))
        .await?;
    Ok(())
}

/// Say something to the session.
pub fn say(session: &Session, message: &str) {
    session.send(json!({"command": "say", "message": message}));
}
