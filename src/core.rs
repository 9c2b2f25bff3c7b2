use std::any::Any;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::executor::StepContext;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Step action provided by the user. It is invoked once per execution with a
/// context scoped to the step's declared consumes and produces.
pub(crate) type Action = Arc<dyn Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Position of a producer within a compiled chain.
///
/// Values supplied by the caller at the start of an execution come from
/// [`Ordinal::Initial`], which sorts before every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ordinal {
    /// The virtual supplier of initial values.
    Initial,
    /// The step at this position of the chain.
    Step(usize),
}

impl Ordinal {
    /// Numeric form of the ordinal, with `-1` standing for [`Ordinal::Initial`].
    pub fn as_isize(self) -> isize {
        match self {
            Ordinal::Initial => -1,
            Ordinal::Step(n) => n as isize,
        }
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_isize())
    }
}

/// Settings for compiling and running chains.
///
/// Hosts usually embed this in their own configuration file, or read it from
/// the environment with [`Options::from_env`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Write a Mermaid rendering of every compiled chain to this path.
    pub graph_output: Option<Utf8PathBuf>,
    /// Run independent steps concurrently in [`Chain::execute_with`](crate::Chain::execute_with).
    pub parallel: bool,
}

impl Options {
    const ENV_GRAPH_OUTPUT: &'static str = "BUILDCHAIN_GRAPH_OUTPUT";
    const ENV_PARALLEL: &'static str = "BUILDCHAIN_PARALLEL";

    /// Reads `BUILDCHAIN_GRAPH_OUTPUT` and `BUILDCHAIN_PARALLEL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let graph_output = lookup(Self::ENV_GRAPH_OUTPUT)
            .filter(|path| !path.trim().is_empty())
            .map(Utf8PathBuf::from);

        let parallel = lookup(Self::ENV_PARALLEL)
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);

        Self {
            graph_output,
            parallel,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ordinal_order() {
        assert!(Ordinal::Initial < Ordinal::Step(0));
        assert!(Ordinal::Step(0) < Ordinal::Step(3));
        assert_eq!(Ordinal::Initial.as_isize(), -1);
        assert_eq!(Ordinal::Step(4).to_string(), "4");
    }

    #[test]
    fn test_options_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("BUILDCHAIN_GRAPH_OUTPUT", "target/chain.mmd"),
            ("BUILDCHAIN_PARALLEL", "True"),
        ]
        .into_iter()
        .collect();

        let options = Options::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(
            options.graph_output.as_deref(),
            Some(camino::Utf8Path::new("target/chain.mmd"))
        );
        assert!(options.parallel);

        let options = Options::from_lookup(|_| None);
        assert_eq!(options, Options::default());

        let options = Options::from_lookup(|_| Some("  ".to_string()));
        assert!(options.graph_output.is_none());
        assert!(!options.parallel);
    }

    #[test]
    fn test_options_deserialize() {
        let options: Options = serde_json::from_str(r#"{"parallel":true}"#).unwrap();
        assert!(options.parallel);
        assert!(options.graph_output.is_none());

        let options: Options = serde_json::from_str(r#"{"graph_output":"out/graph.mmd"}"#).unwrap();
        assert_eq!(options.graph_output, Some(Utf8PathBuf::from("out/graph.mmd")));
        assert!(!options.parallel);
    }
}
