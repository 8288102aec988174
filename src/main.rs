use clap::{Arg, Command};
use dmarc_rewrite_milter::config::FileConfig;
use dmarc_rewrite_milter::Milter;
use log::LevelFilter;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("dmarc-rewrite-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that rewrites From addresses for DMARC-protected domains")
        .long_about(
            "Rewrites the From header of outbound mail whose sending domain \
             publishes a restrictive DMARC policy. The original address is \
             encoded into a reversible alias under a domain you control and \
             stashed in X-Original-From so a later hop can restore it.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/dmarc-rewrite-milter.yaml"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Override the configured milter port")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match FileConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let mut settings = match config.resolve() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            process::exit(1);
        }
    };

    if let Some(port) = matches.get_one::<String>("port") {
        match port.parse::<u16>() {
            Ok(port) => settings.milter_port = port,
            Err(_) => {
                eprintln!("Invalid port: {port}");
                process::exit(1);
            }
        }
    }

    // Initialize logger; --verbose wins over the configured level
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        settings.log_level
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if matches.get_flag("test-config") {
        println!("🔍 Testing configuration...");
        println!();
        match &settings.domain {
            Some(domain) => println!("Rewrite domain: {}", domain),
            None => println!("Rewrite domain: (none, forward rewriting disabled)"),
        }
        println!("Quote character: {:?}", settings.quote_char);
        println!(
            "Forward rewriting: {}  Reverse rewriting: {}",
            settings.forward, settings.reverse
        );
        if settings.require.is_empty() {
            println!("Requirement rules: none (every message qualifies)");
        } else {
            println!("Requirement rules ({} total):", settings.require.len());
            for (name, rule) in &settings.require {
                println!("  {}: {:?}", name, rule);
            }
        }
        match &settings.socket_path {
            Some(path) => println!("Listen: unix socket {}", path),
            None => println!(
                "Listen: {}:{}",
                settings.listen_address, settings.milter_port
            ),
        }
        println!();
        println!("✅ Configuration OK");
        return;
    }

    if matches.get_flag("daemon") {
        daemonize();
    }

    let milter = Milter::new(settings);
    if let Err(e) = milter.run().await {
        log::error!("Milter failed: {e}");
        process::exit(1);
    }
}

fn generate_default_config(path: &str) {
    match FileConfig::sample().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Edit 'domain' before pointing your MTA at the filter.");
        }
        Err(e) => {
            eprintln!("Error writing configuration: {e}");
            process::exit(1);
        }
    }
}

/// Classic double-fork daemonization (FreeBSD/Unix).
fn daemonize() {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        log::info!("Starting milter in daemon mode...");

        // First fork
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("Failed to fork process");
                process::exit(1);
            }
            0 => {
                // Child process continues
            }
            _ => {
                // Parent process exits
                process::exit(0);
            }
        }

        // Create new session (become session leader)
        if unsafe { libc::setsid() } == -1 {
            log::error!("Failed to create new session");
            process::exit(1);
        }

        // Ignore SIGHUP to prevent daemon from being killed when session leader exits
        unsafe {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }

        // Second fork so we are not a session leader and cannot acquire a
        // controlling terminal
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("Failed to second fork");
                process::exit(1);
            }
            0 => {
                // Child process continues as daemon
            }
            _ => {
                process::exit(0);
            }
        }

        // Change working directory to root to avoid keeping any directory in use
        let root_path = std::ffi::CString::new("/").unwrap();
        if unsafe { libc::chdir(root_path.as_ptr()) } == -1 {
            log::warn!("Failed to change working directory to /");
        }

        // Set file creation mask
        unsafe {
            libc::umask(0);
        }

        // Redirect standard file descriptors to /dev/null instead of closing
        // them so stray writes cannot hit a reused descriptor
        if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
            let null_fd = dev_null.as_raw_fd();
            unsafe {
                libc::dup2(null_fd, 0); // stdin
                libc::dup2(null_fd, 1); // stdout
                libc::dup2(null_fd, 2); // stderr
            }
            std::mem::forget(dev_null);
        } else {
            log::warn!("Failed to open /dev/null, closing standard file descriptors");
            unsafe {
                libc::close(0);
                libc::close(1);
                libc::close(2);
            }
        }

        // Write PID file for the rc system
        let pid_file_path = "/var/run/dmarc-rewrite-milter.pid";
        let pid = unsafe { libc::getpid() };
        if let Err(e) = std::fs::write(pid_file_path, pid.to_string()) {
            log::warn!("Failed to write PID file: {e}");
        } else {
            log::info!("PID file written: {pid_file_path} ({pid})");
        }

        // Clean up the PID file on shutdown
        if let Err(e) = ctrlc::set_handler(move || {
            if std::path::Path::new(pid_file_path).exists() {
                if let Err(e) = std::fs::remove_file(pid_file_path) {
                    log::warn!("Failed to remove PID file: {e}");
                }
            }
            std::process::exit(0);
        }) {
            log::warn!("Failed to install shutdown handler: {e}");
        }
    }

    #[cfg(not(unix))]
    {
        log::warn!("Daemon mode not supported on this platform, running in foreground");
    }
}
