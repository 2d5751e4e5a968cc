use std::sync::LazyLock;

use crate::database::constants::DATABASE_LOGGER_NAME;
use crate::logger::Logger;

pub static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new(DATABASE_LOGGER_NAME));
