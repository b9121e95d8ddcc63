use crossbeam_channel::{select, unbounded, Sender};
use hrv_logger::platform::BtleplugStack;
use hrv_logger::{Config, Event, SessionManager};
use std::io::BufRead;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy)]
enum Command {
    Quit,
    Disconnect,
    Reconnect,
    ToggleLogging,
}

/// Reads console commands until `q` or end of input.
fn read_commands(commands: Sender<Command>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let command = match line.trim() {
            "q" | "quit" => Command::Quit,
            "d" => Command::Disconnect,
            "c" => Command::Reconnect,
            "l" => Command::ToggleLogging,
            "" => continue,
            other => {
                log::warn!(
                    "Unknown command {:?} (q: quit, d: disconnect, c: reconnect, l: toggle logging)",
                    other
                );
                continue;
            }
        };
        if commands.send(command).is_err() {
            return;
        }
    }
    let _ = commands.send(Command::Quit);
}

fn on_event(manager: &mut SessionManager, config: &Config, event: Event) {
    match event {
        Event::ServicesDiscovered { address } => {
            if config.auto_enable_heart_rate {
                if let Some(heart_rate) = manager.registry().heart_rate() {
                    log::info!("Enabling heart rate notifications on {}", address);
                    manager.enable_sensor(heart_rate.as_ref(), true);
                }
            }
        }
        Event::DataAvailable { address, text, .. } => {
            println!("{} {}", address, text.replace('\n', " | "));
        }
        Event::Connected { .. } | Event::Disconnected { .. } => {}
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().unwrap_or_else(|e| {
        log::warn!("{}. Using defaults.", e);
        Config::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let addresses = if args.is_empty() { config.devices.clone() } else { args };
    if addresses.is_empty() {
        log::error!(
            "No devices given. Usage: hrv-logger AA:BB:CC:DD:EE:FF [...] \
             or set `devices` in the config file"
        );
        return ExitCode::from(2);
    }

    let stack = match BtleplugStack::new() {
        Ok(stack) => stack,
        Err(e) => {
            log::error!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut manager = SessionManager::new(Box::new(stack), &config);
    if !manager.initialize() {
        return ExitCode::FAILURE;
    }

    let callbacks = manager.callback_receiver();
    let events = manager.event_bus().subscribe();
    let (command_sender, commands) = unbounded();
    std::thread::spawn(move || read_commands(command_sender));

    for address in &addresses {
        if manager.connect(address) {
            log::info!("Connecting to {}", address);
        }
    }

    loop {
        select! {
            recv(callbacks) -> callback => match callback {
                Ok(callback) => manager.handle_event(callback),
                Err(_) => break,
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    on_event(&mut manager, &config, event);
                }
            },
            recv(commands) -> command => match command {
                Ok(Command::Quit) | Err(_) => break,
                Ok(Command::Disconnect) => manager.disconnect(),
                Ok(Command::Reconnect) => {
                    for address in &addresses {
                        manager.connect(address);
                    }
                }
                Ok(Command::ToggleLogging) => {
                    let on = !manager.is_logging();
                    manager.set_logging(on);
                    let state = if on { "enabled" } else { "disabled" };
                    log::info!("Logging for new connections {}", state);
                }
            },
        }
    }

    log::info!("Shutting down");
    manager.shutdown();
    ExitCode::SUCCESS
}
