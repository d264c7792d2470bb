//! 人工输入通道
//!
//! 升级通知、审批门节点、分解失败后的澄清都通过 ask(prompt) 阻塞等待答复；
//! 返回 None 表示通道不可用或对方未答复。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[async_trait]
pub trait HumanInput: Send + Sync {
    async fn ask(&self, prompt: &str) -> Option<String>;
}

/// 答复是否表示同意（以 y 开头，大小写不敏感）
pub fn is_approval(answer: &str) -> bool {
    answer.trim_start().to_lowercase().starts_with('y')
}

/// 按顺序回放预置答复，并记录收到的问题（测试用）
#[derive(Debug, Default)]
pub struct ScriptedHuman {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedHuman {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HumanInput for ScriptedHuman {
    async fn ask(&self, prompt: &str) -> Option<String> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        self.answers.lock().ok().and_then(|mut a| a.pop_front())
    }
}

/// 终端：打印问题，读一行 stdin
#[derive(Debug, Default)]
pub struct StdinHuman;

#[async_trait]
impl HumanInput for StdinHuman {
    async fn ask(&self, prompt: &str) -> Option<String> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("\n[needs input] {}\n> ", prompt).as_bytes())
            .await
            .ok()?;
        stdout.flush().await.ok()?;
        let mut line = String::new();
        let n = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .ok()?;
        if n == 0 {
            return None;
        }
        Some(line.trim().to_string())
    }
}
