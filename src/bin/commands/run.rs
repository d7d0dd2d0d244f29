use evmqtt::{
    config::{self, Config},
    device::{self, DeviceDescriptor},
    gateway::{self, Gateway, Settings},
    registry::{Control, Mode, Options, Registry},
    source::InputSource,
};
use log::{error, info};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    path::Path,
    sync::{
        mpsc::{self, Sender},
        Arc,
    },
    thread,
};

pub fn run(args: &crate::App) {
    let config = match config::load(args.config.as_deref(), args.auto_discover) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    // devices are opened before connecting, so a missing device does not
    // leave a half announced gateway behind
    let (mode, devices) = if config.auto_discover {
        (Mode::Discovery, open_discovered(&config))
    } else {
        (Mode::Manual, open_manual(&config))
    };

    if devices.is_empty() {
        error!("no input devices could be opened");
        std::process::exit(1);
    }

    let (control_tx, control_rx) = mpsc::channel();

    let settings = Settings {
        host: config.serverip.clone(),
        port: config.port,
        username: config.username.clone(),
        password: config.password.clone(),
        client_id: gateway::client_id(),
    };

    let (gateway, connection) = match Gateway::connect(&settings, control_tx.clone()) {
        Ok(res) => res,
        Err(e) => {
            error!("mqtt: {e}");
            std::process::exit(1);
        }
    };

    let gateway = Arc::new(gateway);

    if !gateway.wait_connected(config.connect_timeout) {
        error!(
            "{}:{}: no connection to mqtt broker within {}",
            settings.host,
            settings.port,
            humantime::format_duration(config.connect_timeout)
        );
        std::process::exit(1);
    }

    let options = Options {
        mode,
        base_topic: config.topic.clone(),
        gateway_name: config.name.clone(),
        ignored_keys: config.ignored_keys.clone(),
    };

    let mut registry = Registry::with_channel(gateway.clone(), options, control_tx, control_rx);

    for (descriptor, source) in devices {
        if let Err(e) = registry.add(descriptor, source) {
            error!("{e}");
            std::process::exit(1);
        }
    }

    info!("started with {} device(s)", registry.live());

    if let Err(e) = watch_signals(registry.sender()) {
        error!("signals: {e}");
        std::process::exit(1);
    }

    registry.run();

    let lost = registry.live() == 0;

    registry.shutdown();
    gateway.disconnect();

    if connection.join().is_err() {
        error!("mqtt connection thread panicked");
    }

    if lost {
        std::process::exit(1);
    }
}

fn open_manual(config: &Config) -> Vec<(DeviceDescriptor, InputSource)> {
    let mut list = Vec::new();

    for path in &config.devices {
        let source = match InputSource::open(Path::new(path), config.grab) {
            Ok(source) => source,
            Err(e) => {
                error!("{path}: {e}");
                std::process::exit(1);
            }
        };

        let descriptor = DeviceDescriptor::manual(path, source.name().unwrap_or("unknown"));

        list.push((descriptor, source));
    }

    list
}

fn open_discovered(config: &Config) -> Vec<(DeviceDescriptor, InputSource)> {
    let mut list = Vec::new();

    for mut descriptor in device::discover(config.filter_keys_only) {
        descriptor.enabled = config.initially_enabled(&descriptor.path);

        info!(
            "  {} ({}) -> {}",
            descriptor.name, descriptor.path, descriptor.slug
        );

        // unreadable devices are skipped, the others are still usable
        match InputSource::open(Path::new(&descriptor.path), config.grab) {
            Ok(source) => list.push((descriptor, source)),
            Err(e) => error!("{}: {e}", descriptor.path),
        }
    }

    list
}

fn watch_signals(control: Sender<Control>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = shutdown_on_signal(signals.forever(), &control) {
                error!("received signal {signal} during shutdown, exiting");
                std::process::exit(128 + signal);
            }
        })?;

    Ok(())
}

/// The first signal asks for an orderly shutdown. Returns the second signal,
/// which should end the process at once.
fn shutdown_on_signal(
    signals: impl IntoIterator<Item = i32>,
    control: &Sender<Control>,
) -> Option<i32> {
    let mut signals = signals.into_iter();

    let signal = signals.next()?;

    info!("received signal {signal}, shutting down");

    let _ = control.send(Control::Shutdown);

    signals.next()
}
