use std::io::{self, Write};

use harvest_engine_rs::task::TaskRecord;

use crate::models::CLIConfig;

pub fn banner(store: &str) {
    println!("Harvest Debug CLI");
    println!("Store: {}", store);
    println!("Type /help for commands.");
}

pub fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

pub fn help() {
    println!("Commands:");
    println!("  /help                 Show commands");
    println!("  /exit | /quit         Exit");
    println!("  /tasks [status]       List tasks, newest first");
    println!("  /show <id>            Show one task record");
    println!("  /resumable            List paused tasks that can resume");
    println!("  /watch <id>           Follow a task until it settles");
    println!("  /config               Show current config");
}

pub fn tasks(tasks: &[TaskRecord]) {
    if tasks.is_empty() {
        println!("no tasks");
        return;
    }
    for task in tasks {
        println!("{}", row(task));
    }
}

pub fn row(task: &TaskRecord) -> String {
    format!(
        "[{}] #{} {} ({}) {}% {}/{} failed={}",
        task.status,
        task.id,
        task.task_name,
        task.task_type,
        task.progress,
        task.processed_items,
        task.total_items,
        task.failed_items
    )
}

pub fn task(task: &TaskRecord) {
    println!("{}", row(task));
    if let Some(step) = &task.current_step {
        println!("  step: {}", step);
    }
    println!("  resumable: {}", task.can_resume);
    println!("  created: {}", task.created_at);
    if let Some(started) = task.started_at {
        println!("  started: {}", started);
    }
    if let Some(done) = task.completed_at {
        println!("  completed: {}", done);
    }
    if let Some(err) = &task.error_message {
        println!("  error: {}", err);
    }
    if let Some(result) = &task.result_data {
        println!("  result: {}", result);
    }
    if let Some(resume) = &task.resume_data {
        println!("  resume: {}", resume);
    }
}

pub fn config(cfg: &CLIConfig) {
    let engine = &cfg.engine;
    println!("config:");
    println!("  store: {}", engine.store_backend);
    println!("  path: {}", engine.store_path.display());
    println!("  poll: {:?}", engine.poll_interval);
    println!("  batch: {}", engine.batch_size);
    println!("  attempts: {}", engine.max_attempts);
    println!("  markers: {}", engine.challenge_markers.join(", "));
    println!("  limit: {}", cfg.limit);
    println!("  watch: {:?} x{}", cfg.watch_interval, cfg.watch_rounds);
}

pub fn info(msg: &str) {
    println!("{}", msg);
}

pub fn error(msg: &str) {
    eprintln!("error: {}", msg);
}
