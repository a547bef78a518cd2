pub mod network {
    pub const SSH_DEFAULT_HOST: &str = "127.0.0.1";
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const SSH_DEFAULT_USER: &str = "root";
    pub const DEFAULT_CONNECT_TIMEOUT: &str = "5m";
    pub const MAX_CONNECT_TIMEOUT_SECS: u64 = 86_400;
    pub const TIMEOUT_TCP_DIAL_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 30;
    pub const POLL_INTERVAL_MS: u64 = 10;
}

pub mod retry {
    pub const BASE_DELAY_MS: u64 = 500;
    pub const MAX_DELAY_MS: u64 = 10_000;
    pub const CANCEL_CHECK_MS: u64 = 100;
}

pub mod script {
    pub const DEFAULT_SCRIPT_PATH: &str = "/tmp/linux-%RAND%.sh";
    pub const RANDOM_PLACEHOLDER: &str = "%RAND%";
    pub const DEFAULT_SHEBANG: &str = "#!/bin/sh\n";
    pub const DEFAULT_WORKING_DIRECTORY: &str = ".";
    pub const UPLOAD_MODE: i32 = 0o777;
}

pub mod files {
    pub const UPLOAD_MODE: i32 = 0o644;
    pub const DEFAULT_FILE_MODE: &str = "644";
    pub const DEFAULT_DIRECTORY_MODE: &str = "755";
}
