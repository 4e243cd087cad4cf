//! Rule templates: fixed subtask plans per task type.
//!
//! Dependencies are expressed by sibling name and resolved to ids during
//! the decomposer's second pass.

use drover_db::models::SubtaskType;

/// One subtask specification inside a template.
#[derive(Debug, Clone, Copy)]
pub struct SubtaskSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub subtask_type: SubtaskType,
    pub recommended_tool: Option<&'static str>,
    pub complexity: i32,
    pub priority: i32,
    pub dependency_names: &'static [&'static str],
}

pub const DEFAULT_TASK_TYPE: &str = "develop_feature";

const DEVELOP_FEATURE: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "Code Generation",
        description: "Generate the main code implementation based on requirements",
        subtask_type: SubtaskType::CodeGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 3,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Code Review",
        description: "Review generated code for quality, security, and best practices",
        subtask_type: SubtaskType::CodeReview,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 80,
        dependency_names: &["Code Generation"],
    },
    SubtaskSpec {
        name: "Test Generation",
        description: "Generate unit tests and integration tests for the code",
        subtask_type: SubtaskType::TestGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 70,
        dependency_names: &["Code Generation"],
    },
    SubtaskSpec {
        name: "Documentation",
        description: "Generate documentation including docstrings and README updates",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 1,
        priority: 50,
        dependency_names: &["Code Review", "Test Generation"],
    },
];

const BUG_FIX: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "Bug Analysis",
        description: "Analyze the bug report and identify root cause",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Fix Implementation",
        description: "Implement the bug fix based on analysis",
        subtask_type: SubtaskType::CodeGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 3,
        priority: 90,
        dependency_names: &["Bug Analysis"],
    },
    SubtaskSpec {
        name: "Regression Testing",
        description: "Create regression tests to prevent future occurrences",
        subtask_type: SubtaskType::TestGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 80,
        dependency_names: &["Fix Implementation"],
    },
];

const REFACTOR: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "Code Analysis",
        description: "Analyze existing code structure and identify refactoring opportunities",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Refactoring",
        description: "Perform the refactoring while maintaining functionality",
        subtask_type: SubtaskType::CodeGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 4,
        priority: 90,
        dependency_names: &["Code Analysis"],
    },
    SubtaskSpec {
        name: "Test Verification",
        description: "Verify all existing tests still pass after refactoring",
        subtask_type: SubtaskType::TestGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 80,
        dependency_names: &["Refactoring"],
    },
];

const CODE_REVIEW: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "Static Analysis",
        description: "Perform static code analysis for potential issues",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: Some("claude_code"),
        complexity: 1,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Security Review",
        description: "Review code for security vulnerabilities",
        subtask_type: SubtaskType::CodeReview,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 90,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Review Report",
        description: "Generate comprehensive code review report",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 1,
        priority: 80,
        dependency_names: &["Static Analysis", "Security Review"],
    },
];

const DOCUMENTATION: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "API Documentation",
        description: "Generate or update API documentation",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "User Guide",
        description: "Create or update user documentation",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 90,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "README Update",
        description: "Update README with latest information",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 1,
        priority: 80,
        dependency_names: &["API Documentation", "User Guide"],
    },
];

const TESTING: &[SubtaskSpec] = &[
    SubtaskSpec {
        name: "Test Planning",
        description: "Create test plan and identify test cases",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 100,
        dependency_names: &[],
    },
    SubtaskSpec {
        name: "Unit Test Implementation",
        description: "Implement unit tests",
        subtask_type: SubtaskType::TestGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 2,
        priority: 90,
        dependency_names: &["Test Planning"],
    },
    SubtaskSpec {
        name: "Integration Test Implementation",
        description: "Implement integration tests",
        subtask_type: SubtaskType::TestGeneration,
        recommended_tool: Some("claude_code"),
        complexity: 3,
        priority: 80,
        dependency_names: &["Test Planning"],
    },
    SubtaskSpec {
        name: "Test Execution Report",
        description: "Execute tests and generate report",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: Some("claude_code"),
        complexity: 1,
        priority: 70,
        dependency_names: &["Unit Test Implementation", "Integration Test Implementation"],
    },
];

/// Template lookup by task type, falling back to the default template.
pub fn template_for(task_type: &str) -> &'static [SubtaskSpec] {
    match task_type {
        "develop_feature" => DEVELOP_FEATURE,
        "bug_fix" => BUG_FIX,
        "refactor" => REFACTOR,
        "code_review" => CODE_REVIEW,
        "documentation" => DOCUMENTATION,
        "testing" => TESTING,
        _ => DEVELOP_FEATURE,
    }
}

/// Task types with a dedicated template.
pub fn supported_task_types() -> &'static [&'static str] {
    &[
        "develop_feature",
        "bug_fix",
        "refactor",
        "code_review",
        "documentation",
        "testing",
    ]
}
