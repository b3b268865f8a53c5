use std::io;
use std::thread;

use harvest_engine_rs::task::{TaskId, TaskStatus};

use crate::client::StoreClient;
use crate::models::CLIConfig;
use crate::render;

pub struct REPL {
    pub config: CLIConfig,
    pub client: StoreClient,
}

impl REPL {
    pub fn new(config: CLIConfig, client: StoreClient) -> Self {
        Self { config, client }
    }

    pub fn run(&mut self) {
        render::banner(&self.client.describe());
        loop {
            render::prompt();
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('/') {
                render::info("commands start with '/', type /help");
                continue;
            }
            if self.handle_command(line) {
                break;
            }
        }
    }

    fn handle_command(&mut self, line: &str) -> bool {
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("").trim_start_matches('/');
        let rest = parts.next().unwrap_or("").trim();
        match cmd {
            "exit" | "quit" => return true,
            "help" => render::help(),
            "tasks" => {
                let status = if rest.is_empty() {
                    None
                } else {
                    match rest.parse::<TaskStatus>() {
                        Ok(status) => Some(status),
                        Err(err) => {
                            render::error(&err.to_string());
                            return false;
                        }
                    }
                };
                match self.client.list_tasks(status, self.config.limit) {
                    Ok(tasks) => render::tasks(&tasks),
                    Err(err) => render::error(&err),
                }
            }
            "show" => {
                if let Some(id) = parse_id(rest) {
                    match self.client.get_task(id) {
                        Ok(task) => render::task(&task),
                        Err(err) => render::error(&err),
                    }
                }
            }
            "resumable" => match self.client.resumable() {
                Ok(tasks) => render::tasks(&tasks),
                Err(err) => render::error(&err),
            },
            "watch" => {
                if let Some(id) = parse_id(rest) {
                    self.watch(id);
                }
            }
            "config" => render::config(&self.config),
            _ => render::info("unknown command, type /help"),
        }
        false
    }

    /// Prints the task whenever its row changes, until it leaves `running`
    /// or the configured number of rounds passes.
    fn watch(&self, id: TaskId) {
        let mut last = String::new();
        for _ in 0..self.config.watch_rounds {
            let task = match self.client.get_task(id) {
                Ok(task) => task,
                Err(err) => {
                    render::error(&err);
                    return;
                }
            };
            let row = render::row(&task);
            if row != last {
                render::info(&row);
                last = row;
            }
            if task.status != TaskStatus::Running && task.status != TaskStatus::Pending {
                return;
            }
            thread::sleep(self.config.watch_interval);
        }
        render::info("still running, stopped watching");
    }
}

fn parse_id(value: &str) -> Option<TaskId> {
    match value.parse::<TaskId>() {
        Ok(id) => Some(id),
        Err(_) => {
            render::error("expected a numeric task id");
            None
        }
    }
}
