//! Deterministic code executor: submits the cell's current source to the
//! interactive runtime and captures the outcome onto the task.

use async_trait::async_trait;

use crate::outputs;

use super::{Agent, AgentContext, AgentState};

#[derive(Debug)]
pub struct CodeExecutor {
    context: AgentContext,
}

impl CodeExecutor {
    pub fn new(context: AgentContext) -> CodeExecutor {
        CodeExecutor { context }
    }
}

#[async_trait]
impl Agent for CodeExecutor {
    fn name(&self) -> &'static str {
        "CodeExecutor"
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        let source = self.context.with_task(|task| task.cell_code.clone());
        outputs::debug(format!("executing cell code: {:.80?}", source));
        let run = {
            let mut runtime = self.context.runtime.lock();
            runtime.run_cell(&source)?
        };

        let mut output = String::new();
        if !run.stdout.is_empty() {
            output.push_str("Stdout:\n");
            output.push_str(&run.stdout);
            output.push('\n');
        }
        if !run.stderr.is_empty() {
            output.push_str("Stderr:\n");
            output.push_str(&run.stderr);
            output.push('\n');
        }
        let displays = run.display_texts();
        if !displays.is_empty() {
            output.push_str("Outputs:\n");
            for text in &displays {
                output.push_str(text);
                output.push('\n');
            }
        }

        self.context.with_task(|task| {
            task.set_cell_output(&output);
            if run.success {
                task.set_cell_result(&run.result);
                task.set_cell_error("");
            } else {
                task.set_cell_error(&run.error);
            }
        });
        if run.success {
            outputs::debug(format!("execution result: {:.80?}", run.result));
            Ok((false, AgentState::Flag(true)))
        } else {
            outputs::error(format!("execution failed: {}", run.error));
            Ok((true, AgentState::Flag(false)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::contexts::CellRunResult;

    fn executor_with(result: CellRunResult) -> CodeExecutor {
        let (factory, runtime) = test_factory("-s executing", "print(len(df))");
        runtime.push_result(result);
        CodeExecutor::new(factory.context.clone())
    }

    #[tokio::test]
    async fn test_success_captures_result_and_clears_error() {
        let mut executor = executor_with(CellRunResult {
            success: true,
            result: "100".to_string(),
            stdout: "100\n".to_string(),
            ..Default::default()
        });
        // Seed a stale error from a previous failed run.
        executor
            .context
            .with_task(|task| task.set_cell_error("NameError: boom"));
        let (failed, state) = executor.call().await.unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Flag(true));
        executor.context.with_task(|task| {
            assert_eq!(task.cell_result(), "100");
            assert!(task.cell_output().contains("Stdout:\n100"));
            assert_eq!(task.cell_error(), "");
        });
    }

    #[tokio::test]
    async fn test_failure_captures_error() {
        let mut executor = executor_with(CellRunResult {
            success: false,
            error: "NameError: name 'df' is not defined".to_string(),
            ..Default::default()
        });
        let (failed, state) = executor.call().await.unwrap();
        assert!(failed);
        assert_eq!(state, AgentState::Flag(false));
        executor
            .context
            .with_task(|task| assert!(task.cell_error().contains("NameError")));
    }
}
