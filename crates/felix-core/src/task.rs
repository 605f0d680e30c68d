use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relative size of a task, as estimated by the plan author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Epic,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Moderate
    }
}

impl Complexity {
    /// Wall-clock budget for one attempt at a task of this size.
    pub fn timeout(&self) -> Duration {
        let minutes = match self {
            Complexity::Trivial => 2,
            Complexity::Simple => 5,
            Complexity::Moderate => 10,
            Complexity::Complex => 20,
            Complexity::Epic => 30,
        };
        Duration::from_secs(minutes * 60)
    }

    /// Rough token volume (input, output) one attempt consumes.
    pub fn estimated_tokens(&self) -> (u64, u64) {
        match self {
            Complexity::Trivial => (8_000, 1_000),
            Complexity::Simple => (20_000, 3_000),
            Complexity::Moderate => (50_000, 8_000),
            Complexity::Complex => (120_000, 20_000),
            Complexity::Epic => (250_000, 40_000),
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
            Complexity::Epic => write!(f, "epic"),
        }
    }
}

/// Scheduling priority. Orders as `Critical < High < Medium < Low` so that a
/// plain ascending sort puts the most urgent task first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// One unit of work in a plan. Immutable once the plan is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            files_affected: Vec::new(),
            complexity: Complexity::default(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_affected = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    /// True when every dependency is in `completed`.
    pub fn is_ready<S: AsRef<str>>(&self, completed: &[S]) -> bool {
        self.dependencies
            .iter()
            .all(|dep| completed.iter().any(|c| c.as_ref() == dep))
    }

    /// Per-attempt timeout derived from complexity.
    pub fn timeout(&self) -> std::time::Duration {
        self.complexity.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("T-1", "Add login form");
        assert_eq!(task.complexity, Complexity::Moderate);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_is_ready() {
        let task = Task::new("B", "second").with_dependencies(["A"]);
        let none: [&str; 0] = [];
        assert!(!task.is_ready(&none));
        assert!(task.is_ready(&["A"]));
        assert!(Task::new("A", "first").is_ready(&none));
    }

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_complexity_timeouts_within_bounds() {
        assert_eq!(Complexity::Trivial.timeout().as_secs(), 120);
        assert_eq!(Complexity::Epic.timeout().as_secs(), 1800);
    }

    #[test]
    fn test_task_camel_case_json() {
        let json = r#"{
            "id": "T-1",
            "title": "Wire auth",
            "acceptanceCriteria": ["login works"],
            "filesAffected": ["src/auth.rs"],
            "complexity": "complex",
            "priority": "high"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.acceptance_criteria, vec!["login works"]);
        assert_eq!(task.files_affected, vec!["src/auth.rs"]);
        assert_eq!(task.complexity, Complexity::Complex);
        assert_eq!(task.priority, Priority::High);
    }
}
