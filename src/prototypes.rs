//! Built-in prototype workflows.
//!
//! | Workflow | Step | Input | Output |
//! |----------|------|-------|--------|
//! | `demo` | `rephrase` | `input` | `input`, `answer` (lines), `sentiment`, `prompt` |
//! | `support` | `generate` | `support_request` | `suggestion`, `helpdesk_url`, `sentiment`, `prompt`, `context` |
//! | `support` | `search` | `query`, `limit` | `matches` |
//! | `support` | `ask` | `question` | `answer`, `sources` |
//! | `complaint` | `identify_problem` | `complaint` | `complaint`, `problems` (lines), `sentiment`, `prompt` |
//! | `complaint` | `solve_problem` | `complaint`, `problems`, `sentiment` | `complaint`, `problems`, `sentiment`, `answer`, `prompt` |
//!
//! Recognized options: `with_translation` (bool), `with_sentiment` (bool,
//! accepted but no classifier is wired in, so a produced `sentiment` is
//! always null; `solve_problem` still passes a caller-supplied one to the
//! model), and for `support` the string `helpdesk_url` prefix.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::Config;
use crate::ingest::open_store;
use crate::llm::{Generator, OllamaGenerator};
use crate::models::SearchMatch;
use crate::store::sqlite::SqliteVectorStore;
use crate::store::VectorStore;
use crate::translate::{resilient_translate, LlmTranslator, Translator};
use crate::workflow::{Step, StepInput, Workflow};

/// Similarity search as seen by workflows.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>>;
}

/// Wraps an already opened store.
pub struct StoreRetriever(pub Arc<dyn VectorStore>);

#[async_trait]
impl Retriever for StoreRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>> {
        Ok(self.0.search(query, k).await?)
    }
}

/// A client's persisted index, opened on first use.
pub struct ClientIndex {
    config: Config,
    client: String,
    store: OnceCell<SqliteVectorStore>,
}

impl ClientIndex {
    pub fn new(config: Config, client: impl Into<String>) -> Self {
        Self {
            config,
            client: client.into(),
            store: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Retriever for ClientIndex {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>> {
        let store = self
            .store
            .get_or_try_init(|| open_store(&self.config, &self.client))
            .await?;
        Ok(store.search(query, k).await?)
    }
}

/// Capabilities handed to workflow builders.
#[derive(Clone)]
pub struct Services {
    pub generator: Arc<dyn Generator>,
    pub translator: Arc<dyn Translator>,
    pub retriever: Arc<dyn Retriever>,
    pub target_source_chunks: usize,
}

impl Services {
    /// Ollama generation, LLM translation and the client's own index.
    pub fn from_config(config: &Config, client: &str) -> Result<Self> {
        let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.llm)?);
        Ok(Self {
            translator: Arc::new(LlmTranslator::new(generator.clone())),
            generator,
            retriever: Arc::new(ClientIndex::new(config.clone(), client)),
            target_source_chunks: config.retrieval.target_source_chunks,
        })
    }
}

/// Strips the leading indentation of every line and surrounding blank lines.
fn dedent(template: &str) -> String {
    template
        .lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

const PROBLEMS_PROMPT: &str = r#"
    You are a helpful fact-oriented assistant.
    Extract the problems behind the complaint.
    Keep the meaning of the input text. NEVER ADD OR REMOVE ANY INFORMATION.
    USE SIMPLE LANGUAGE WITHOUT SUBORDINATE CLAUSES.
    Instead of "The problem behind the complaint is that <problem>.", write "<problem>."
    Identify all problems. Output one problem per line.
    Don't presume anything. If no problems are stated explicitly, don't add them.

    Input text:
    "{input}"

    Output text:
"#;

const SOLVE_PROMPT: &str = r#"
    You are a helpful specialist in fixing (alleged) construction defects.
    You work the company that built the client's building.
    React empathically to the customer's complaint and provide an approach to solve each problem.
    Keep in mind, that the customer blames your employer for the problems, even if not stated directly in the original complaint.
    You want to help the customer, but you don't want to admit any guilt.
    DON'T REFER TO YOUR ROLE. You are inherently representing your employer's company.

    Problems:
    {problems}

    The original complaint was:
    "{complaint}"
    {sentiment}
    Write an email to the customer. Start with a message of empathy reflecting the sentiment of the complaint.
    Then, provide a solution for each problem. USE SIMPLE LANGUAGE WITHOUT SUBORDINATE CLAUSES.
    DON'T ASSUME ANYTHING ABOUT THE CAUSE OF THE PROBLEMS. If you can't draw the cause from the original complaint, ask the customer.
    Return just the email body, no subject.

    Output text:
"#;

const QA_PROMPT: &str = r#"
    Use the following pieces of context to answer the question at the end.
    If you don't know the answer, just say that you don't know, don't try to make up an answer.

    {context}

    Question: {question}
    Helpful Answer:
"#;

/// Non-empty trimmed lines of a model answer.
fn answer_lines(answer: &str) -> Vec<String> {
    answer
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Prompts the model to list the problems behind `text`.
async fn extract_problems(generator: &dyn Generator, text: &str) -> Result<(Vec<String>, String)> {
    let prompt = dedent(PROBLEMS_PROMPT).replace("{input}", text);
    let answer = generator.generate(&prompt).await?;
    let lines = answer_lines(&answer);
    debug!(lines = lines.len(), "Extracted problems");
    Ok((lines, prompt))
}

pub struct RephraseStep {
    generator: Arc<dyn Generator>,
    translator: Arc<dyn Translator>,
}

#[async_trait]
impl Step for RephraseStep {
    fn name(&self) -> &str {
        "rephrase"
    }

    fn description(&self) -> &str {
        "Extract the problems behind a complaint, one per line"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let mut text = input.require("input")?.to_string();
        if input.flag("with_translation") {
            info!("Translating the input into English");
            text = resilient_translate(self.translator.as_ref(), &text, "de", "en").await?;
        }

        let (lines, prompt) = extract_problems(self.generator.as_ref(), &text).await?;

        Ok(json!({
            "input": text,
            "answer": lines,
            "sentiment": Value::Null,
            "prompt": prompt,
        }))
    }
}

pub struct GenerateStep {
    generator: Arc<dyn Generator>,
    translator: Arc<dyn Translator>,
    retriever: Arc<dyn Retriever>,
    k: usize,
}

fn support_prompt(request: &str) -> String {
    dedent(&format!(
        "
        Answer the following request using the context below.
        Question: {}
        Context:
        ",
        request
    ))
}

#[async_trait]
impl Step for GenerateStep {
    fn name(&self) -> &str {
        "generate"
    }

    fn description(&self) -> &str {
        "Answer a support request from the indexed knowledge base"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let translate = input.flag("with_translation");
        let mut request = input.require("support_request")?.to_string();
        if translate {
            request = resilient_translate(self.translator.as_ref(), &request, "de", "en").await?;
        }

        let matches = self.retriever.retrieve(&request, self.k).await?;
        let context = matches
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = support_prompt(&request);
        let answer = self
            .generator
            .generate(&format!("{}\n{}", prompt, context))
            .await?;

        let suggestion = if translate {
            resilient_translate(self.translator.as_ref(), &answer, "en", "de").await?
        } else {
            answer
        };

        let base = input
            .options
            .get("helpdesk_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let slug = matches
            .first()
            .and_then(|m| m.metadata.get("slug"))
            .map(String::as_str)
            .unwrap_or_default();

        Ok(json!({
            "suggestion": suggestion,
            "helpdesk_url": format!("{}{}", base, slug),
            "sentiment": Value::Null,
            "prompt": prompt,
            "context": matches,
        }))
    }
}

pub struct SearchStep {
    retriever: Arc<dyn Retriever>,
    k: usize,
}

#[async_trait]
impl Step for SearchStep {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Similarity search over the knowledge base without generation"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let query = input.require("query")?;
        let k = input
            .param("limit")
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|&l| l > 0)
            .unwrap_or(self.k);
        let matches = self.retriever.retrieve(query, k).await?;
        Ok(json!({ "matches": matches }))
    }
}

/// A retrieval-augmented answer and the passages it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct QaAnswer {
    pub answer: String,
    pub sources: Vec<SearchMatch>,
    pub elapsed_ms: u128,
}

/// Retrieves the `k` best passages for `question` and has the model answer
/// from them.
pub async fn answer_question(
    generator: &dyn Generator,
    retriever: &dyn Retriever,
    question: &str,
    k: usize,
) -> Result<QaAnswer> {
    let start = Instant::now();
    let sources = retriever.retrieve(question, k).await?;
    let context = sources
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = dedent(QA_PROMPT)
        .replace("{context}", &context)
        .replace("{question}", question);
    let answer = generator.generate(&prompt).await?.trim().to_string();
    Ok(QaAnswer {
        answer,
        sources,
        elapsed_ms: start.elapsed().as_millis(),
    })
}

pub struct AskStep {
    generator: Arc<dyn Generator>,
    retriever: Arc<dyn Retriever>,
    k: usize,
}

#[async_trait]
impl Step for AskStep {
    fn name(&self) -> &str {
        "ask"
    }

    fn description(&self) -> &str {
        "Answer a question from the indexed passages and list them"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let question = input.require("question")?;
        let qa = answer_question(self.generator.as_ref(), self.retriever.as_ref(), question, self.k).await?;
        Ok(json!({
            "answer": qa.answer,
            "sources": qa.sources,
        }))
    }
}

pub struct IdentifyProblemStep {
    generator: Arc<dyn Generator>,
    translator: Arc<dyn Translator>,
}

#[async_trait]
impl Step for IdentifyProblemStep {
    fn name(&self) -> &str {
        "identify_problem"
    }

    fn description(&self) -> &str {
        "List the problems stated in a customer complaint"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let mut complaint = input.require("complaint")?.to_string();
        if input.flag("with_translation") {
            info!("Translating the complaint into English");
            complaint = resilient_translate(self.translator.as_ref(), &complaint, "de", "en").await?;
        }
        let (problems, prompt) = extract_problems(self.generator.as_ref(), &complaint).await?;

        Ok(json!({
            "complaint": complaint,
            "problems": problems,
            "sentiment": Value::Null,
            "prompt": prompt,
        }))
    }
}

/// Problems arrive either as a JSON array (the `identify_problem` output
/// posted back) or as plain text with one problem per line.
fn parse_problems(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => answer_lines(raw),
    }
}

pub struct SolveProblemStep {
    generator: Arc<dyn Generator>,
    translator: Arc<dyn Translator>,
}

#[async_trait]
impl Step for SolveProblemStep {
    fn name(&self) -> &str {
        "solve_problem"
    }

    fn description(&self) -> &str {
        "Draft an empathic reply proposing a solution for each problem"
    }

    async fn run(&self, input: StepInput) -> Result<Value> {
        let complaint = input.require("complaint")?;
        let problems = parse_problems(input.param("problems").unwrap_or_default());
        let sentiment = input.param("sentiment").filter(|s| !s.trim().is_empty());

        let sentiment_line = match sentiment {
            Some(s) if input.flag("with_sentiment") => format!("\nSentiment: {}\n", s),
            _ => String::new(),
        };
        let prompt = dedent(SOLVE_PROMPT)
            .replace("{problems}", &problems.join("\n"))
            .replace("{complaint}", complaint)
            .replace("{sentiment}", &sentiment_line);
        let mut answer = self.generator.generate(&prompt).await?;
        debug!(chars = answer.len(), "Drafted reply");

        if input.flag("with_translation") {
            info!("Translating the answer into German");
            answer = resilient_translate(self.translator.as_ref(), &answer, "en", "de").await?;
        }

        Ok(json!({
            "complaint": complaint,
            "problems": problems,
            "sentiment": sentiment,
            "answer": answer,
            "prompt": prompt,
        }))
    }
}

pub fn complaint_workflow(services: &Services) -> Workflow {
    Workflow::new("complaint")
        .with_step(Arc::new(IdentifyProblemStep {
            generator: services.generator.clone(),
            translator: services.translator.clone(),
        }))
        .with_step(Arc::new(SolveProblemStep {
            generator: services.generator.clone(),
            translator: services.translator.clone(),
        }))
}

pub fn demo_workflow(services: &Services) -> Workflow {
    Workflow::new("demo").with_step(Arc::new(RephraseStep {
        generator: services.generator.clone(),
        translator: services.translator.clone(),
    }))
}

pub fn support_workflow(services: &Services) -> Workflow {
    Workflow::new("support")
        .with_step(Arc::new(GenerateStep {
            generator: services.generator.clone(),
            translator: services.translator.clone(),
            retriever: services.retriever.clone(),
            k: services.target_source_chunks,
        }))
        .with_step(Arc::new(SearchStep {
            retriever: services.retriever.clone(),
            k: services.target_source_chunks,
        }))
        .with_step(Arc::new(AskStep {
            generator: services.generator.clone(),
            retriever: services.retriever.clone(),
            k: services.target_source_chunks,
        }))
}
