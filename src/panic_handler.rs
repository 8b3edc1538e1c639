use log::error;
use std::panic;

pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        error!(
            "Panic on thread '{}': {panic_info}",
            thread.name().unwrap_or("<unnamed>")
        );
        // The log file is the only record once the terminal is gone.
        log::logger().flush();

        default_hook(panic_info);

        std::process::exit(1);
    }));
}
