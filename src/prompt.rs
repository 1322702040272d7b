//! Operator prompts

use std::io::Write;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use once_cell::sync::Lazy;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::Result;

/// The only answer that lets a gated operation proceed
pub const CONFIRMATION: &str = "yes";

/// Asks the operator for a go/no-go decision.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show `message` and return true only if the operator typed "yes"
    async fn confirm(&self, message: &str) -> Result<bool>;
}

/// Reads one answer per line from `R`.
///
/// The buffered reader lives as long as the prompter, so input read ahead
/// while answering one prompt is still there for the next.
pub struct LinePrompter<R> {
    lines: Mutex<Lines<BufReader<R>>>,
}

impl<R: AsyncRead + Unpin> LinePrompter<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(input).lines()),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Prompter for LinePrompter<R> {
    async fn confirm(&self, message: &str) -> Result<bool> {
        let mut lines = self.lines.lock().await;

        println!("{}", message);
        print!("Enter '{}' to continue: ", CONFIRMATION);
        std::io::stdout().flush()?;

        // End of input answers no
        let answer = lines.next_line().await?;
        Ok(answer.as_deref().is_some_and(is_confirmation))
    }
}

/// Process-wide stdin reader shared by every [`StdinPrompter`]
static STDIN: Lazy<LinePrompter<Stdin>> = Lazy::new(|| LinePrompter::new(tokio::io::stdin()));

/// Prompts on the terminal
#[derive(Clone, Copy, Debug, Default)]
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn confirm(&self, message: &str) -> Result<bool> {
        STDIN.confirm(message).await
    }
}

/// Answers every prompt the same way; for `--confirm` and non-interactive runs
#[derive(Clone, Copy, Debug)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl Prompter for FixedAnswer {
    async fn confirm(&self, _message: &str) -> Result<bool> {
        Ok(self.0)
    }
}

fn is_confirmation(input: &str) -> bool {
    input.trim() == CONFIRMATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_literal_yes_confirms() {
        assert!(is_confirmation("yes\n"));
        assert!(is_confirmation("  yes  "));
        assert!(!is_confirmation("y"));
        assert!(!is_confirmation("YES"));
        assert!(!is_confirmation("no"));
        assert!(!is_confirmation(""));
    }

    #[tokio::test]
    async fn piped_answers_are_consumed_one_per_prompt() {
        let prompter = LinePrompter::new(&b"yes\nyes\nno\n"[..]);
        assert!(prompter.confirm("apply the plan?").await.unwrap());
        assert!(prompter.confirm("DNS records created?").await.unwrap());
        assert!(!prompter.confirm("destroy?").await.unwrap());
    }

    #[tokio::test]
    async fn end_of_input_declines() {
        let prompter = LinePrompter::new(&b"yes"[..]);
        assert!(prompter.confirm("first").await.unwrap());
        assert!(!prompter.confirm("second").await.unwrap());
    }

    #[tokio::test]
    async fn fixed_answer_never_reads_input() {
        assert!(FixedAnswer(true).confirm("proceed?").await.unwrap());
        assert!(!FixedAnswer(false).confirm("proceed?").await.unwrap());
    }
}
