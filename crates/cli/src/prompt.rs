use std::io::{BufRead, Write};

use {async_trait::async_trait, gskills_skills::confirm::Confirm};

/// `[y/N]` prompt on stderr, answered from stdin. `--yes` skips the question.
pub struct Prompt {
    assume_yes: bool,
}

impl Prompt {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Confirm for Prompt {
    async fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            ask(&prompt, &mut std::io::stdin().lock(), &mut std::io::stderr())
        })
        .await
        .unwrap_or(false)
    }
}

/// End of input and read errors count as "no".
fn ask(prompt: &str, input: &mut impl BufRead, output: &mut impl Write) -> bool {
    let _ = write!(output, "{prompt} [y/N]: ");
    let _ = output.flush();
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => is_yes(&line),
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
