use chrono::{DateTime, Local};

fn build_datetime() -> DateTime<Local> {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

pub fn get_version_info() -> &'static str {
    Box::leak(
        format!(
            "flowswitch {}\n\
         Build Time: {}\n\
         Git Commit: {}\n\
         Git Branch: {}\n\
         Git Status: {}",
            env!("CARGO_PKG_VERSION"),
            build_datetime().format("%Y-%m-%d %H:%M:%S %Z"),
            env!("GIT_COMMIT_HASH"),
            env!("GIT_BRANCH"),
            env!("GIT_DIRTY")
        )
        .into_boxed_str(),
    )
}

pub fn get_short_version() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    let git_commit = env!("GIT_COMMIT_HASH");
    if env!("GIT_DIRTY") == "dirty" {
        Box::leak(format!("{}-{}-dirty", version, git_commit).into_boxed_str())
    } else {
        Box::leak(format!("{}-{}", version, git_commit).into_boxed_str())
    }
}

/// `User-Agent` for webhook requests when the config does not set one.
pub fn get_useragent() -> String {
    format!(
        "flowswitch/{} (built {})",
        env!("CARGO_PKG_VERSION"),
        build_datetime().format("%Y-%m-%d")
    )
}
