//! Chat prompt formatting keyed by `template_type`.
//!
//! | `template_type`                           | Template                                   |
//! |-------------------------------------------|--------------------------------------------|
//! | `chatml`                                  | ChatML (`<\|im_start\|>` / `<\|im_end\|>`) |
//! | `llama`                                   | LLaMA-2 / Mistral `[INST]` format          |
//! | `chatglm3`                                | ChatGLM3 role markers                      |
//! | `baichuan`                                | Baichuan reserved-token turns              |
//! | `default-generation`, `chatglm-generation`| Bare query, no turn markup                 |
//! | _other_                                   | Plain-text `System/User/Assistant`         |

use crate::context::Turn;

/// Typed chat template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    ChatML,
    LLaMA,
    ChatGLM3,
    Baichuan,
    /// Generation templates: the query alone, history and system ignored.
    Generation,
    /// Plain-text `System/User/Assistant` fallback.
    Default,
}

impl std::str::FromStr for ChatFormat {
    // Parsing never fails; unknown strings map to `Default`.
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "chatml" => Self::ChatML,
            "llama" => Self::LLaMA,
            "chatglm3" => Self::ChatGLM3,
            "baichuan" => Self::Baichuan,
            "default-generation" | "chatglm-generation" => Self::Generation,
            _ => Self::Default,
        })
    }
}

impl ChatFormat {
    pub fn from_template_type(template_type: &str) -> Self {
        template_type.parse().unwrap_or(Self::Default)
    }
}

/// Build a full multi-turn prompt from `history` plus the current `query`,
/// ending with the assistant's opening tag so the model continues directly
/// into its reply.
///
/// When `system` is empty the system block is omitted entirely.
pub fn build_chat_prompt(format: ChatFormat, system: &str, history: &[Turn], query: &str) -> String {
    match format {
        ChatFormat::ChatML => build_chatml(system, history, query),
        ChatFormat::LLaMA => build_llama(system, history, query),
        ChatFormat::ChatGLM3 => build_chatglm3(system, history, query),
        ChatFormat::Baichuan => build_baichuan(system, history, query),
        ChatFormat::Generation => query.to_string(),
        ChatFormat::Default => build_plain(system, history, query),
    }
}

fn build_chatml(system: &str, history: &[Turn], query: &str) -> String {
    let mut s = String::new();
    if !system.is_empty() {
        s.push_str(&format!("<|im_start|>system\n{system}<|im_end|>\n"));
    }
    for turn in history {
        s.push_str(&format!(
            "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n{}<|im_end|>\n",
            turn.query, turn.response
        ));
    }
    s.push_str(&format!("<|im_start|>user\n{query}<|im_end|>\n<|im_start|>assistant\n"));
    s
}

/// ```text
/// <s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{query} [/INST] {response} </s>
/// <s>[INST] {query} [/INST]
/// ```
/// The current turn does not receive a closing `</s>`.
fn build_llama(system: &str, history: &[Turn], query: &str) -> String {
    let mut s = String::new();
    let open = |first: bool, q: &str| {
        if first && !system.is_empty() {
            format!("<s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{q} [/INST]")
        } else {
            format!("<s>[INST] {q} [/INST]")
        }
    };
    for (i, turn) in history.iter().enumerate() {
        s.push_str(&open(i == 0, &turn.query));
        s.push_str(&format!(" {} </s>", turn.response));
    }
    s.push_str(&open(history.is_empty(), query));
    s
}

fn build_chatglm3(system: &str, history: &[Turn], query: &str) -> String {
    let mut s = String::from("[gMASK]sop");
    if !system.is_empty() {
        s.push_str(&format!("<|system|>\n{system}"));
    }
    for turn in history {
        s.push_str(&format!("<|user|>\n{}<|assistant|>\n{}", turn.query, turn.response));
    }
    s.push_str(&format!("<|user|>\n{query}<|assistant|>"));
    s
}

fn build_baichuan(system: &str, history: &[Turn], query: &str) -> String {
    let mut s = system.to_string();
    for turn in history {
        s.push_str(&format!("<reserved_106>{}<reserved_107>{}", turn.query, turn.response));
    }
    s.push_str(&format!("<reserved_106>{query}<reserved_107>"));
    s
}

fn build_plain(system: &str, history: &[Turn], query: &str) -> String {
    let mut s = String::new();
    if !system.is_empty() {
        s.push_str(&format!("System: {system}\n\n"));
    }
    for turn in history {
        s.push_str(&format!("User: {}\nAssistant: {}\n\n", turn.query, turn.response));
    }
    s.push_str(&format!("User: {query}\nAssistant:"));
    s
}
