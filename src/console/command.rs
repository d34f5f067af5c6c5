//! Console command table.

use std::fmt;

use crate::logger::SharedLogger;

/// Reply sent for an unknown command.
pub const NOT_FOUND: &str = "command not found, try `help` for help";

type CommandFn = Box<dyn Fn(&[&str]) -> String + Send + Sync>;

struct Command {
    name: String,
    help: String,
    run: CommandFn,
}

/// What a console line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Blank line.
    Nothing,
    /// `quit`: end the session.
    Quit,
    NotFound(String),
    /// Command output; may be empty.
    Output(String),
}

/// Named commands, looked up by the first word of a line.
///
/// `help` and `quit` are builtin.
pub struct Commands {
    list: Vec<Command>,
    logger: SharedLogger,
}

impl Commands {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            list: Vec::new(),
            logger,
        }
    }

    /// Add a command. `run` receives the words after the name. Reusing a
    /// name (builtins included) is fatal.
    pub fn register<F>(&mut self, name: &str, help: &str, run: F) -> &mut Self
    where
        F: Fn(&[&str]) -> String + Send + Sync + 'static,
    {
        if name == "help" || name == "quit" || self.find(name).is_some() {
            self.logger
                .fatal(format_args!("command {} is already registered", name));
        }

        self.list.push(Command {
            name: name.to_string(),
            help: help.to_string(),
            run: Box::new(run),
        });
        self
    }

    fn find(&self, name: &str) -> Option<&Command> {
        self.list.iter().find(|c| c.name == name)
    }

    /// Text of the builtin `help` command.
    pub fn help(&self) -> String {
        let mut output = String::from("Commands:\r\n");
        output.push_str("help - this help text\r\n");
        for command in &self.list {
            output.push_str(&command.name);
            output.push_str(" - ");
            output.push_str(&command.help);
            output.push_str("\r\n");
        }
        output.push_str("quit - exit console");
        output
    }

    /// Split `line` on whitespace and run the named command.
    pub fn execute(&self, line: &str) -> Execution {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, rest)) = args.split_first() else {
            return Execution::Nothing;
        };

        match name {
            "quit" => Execution::Quit,
            "help" => Execution::Output(self.help()),
            _ => match self.find(name) {
                Some(command) => Execution::Output((command.run)(rest)),
                None => Execution::NotFound(name.to_string()),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl fmt::Debug for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.list.iter().map(|c| &c.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::sync::Arc;

    fn commands() -> Commands {
        let mut commands = Commands::new(Arc::new(NoopLogger));
        commands.register("echo", "repeat the arguments", |args| args.join(" "));
        commands.register("silent", "print nothing", |_| String::new());
        commands
    }

    #[test]
    fn test_execute() {
        let commands = commands();

        assert_eq!(
            commands.execute("  echo  a   b \r"),
            Execution::Output("a b".to_string())
        );
        assert_eq!(commands.execute("silent"), Execution::Output(String::new()));
        assert_eq!(commands.execute("   "), Execution::Nothing);
        assert_eq!(commands.execute("quit now"), Execution::Quit);
        assert_eq!(
            commands.execute("reboot"),
            Execution::NotFound("reboot".to_string())
        );
    }

    #[test]
    fn test_help_lists_commands() {
        let commands = commands();
        let Execution::Output(help) = commands.execute("help") else {
            panic!("help produced no output");
        };

        assert!(help.starts_with("Commands:\r\n"));
        assert!(help.contains("echo - repeat the arguments\r\n"));
        assert!(help.ends_with("quit - exit console"));
        assert_eq!(commands.len(), 2);
    }

    #[test]
    #[should_panic(expected = "command echo is already registered")]
    fn test_duplicate_is_fatal() {
        let mut commands = commands();
        commands.register("echo", "again", |_| String::new());
    }

    #[test]
    #[should_panic(expected = "command help is already registered")]
    fn test_builtin_name_is_fatal() {
        Commands::new(Arc::new(NoopLogger)).register("help", "mine", |_| String::new());
    }
}
