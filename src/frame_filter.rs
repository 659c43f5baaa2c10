use isoblue::Message;
use crate::config::Config;

/// Filters ISOBUS messages based on application configuration
/// The bridge already filters by PGN, this narrows further by source address.
/// # Arguments
/// * `config` - Application configuration containing filter rules
/// * `message` - The message read from a socket
///
/// # Returns
/// true if the message should be processed, false if it should be skipped
pub fn should_process_message(config: &Config, message: &Message) -> bool {
    config
        .source_filter
        .should_accept(message.pgn().as_u32(), message.src_addr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoblue::{GLOBAL_ADDRESS, MessageId, Pgn};

    fn message(pgn: u32, src: u8) -> Message {
        Message::new(MessageId::new(1), src, GLOBAL_ADDRESS, Pgn::new(pgn).unwrap(), vec![0], 0)
    }

    #[test]
    fn test_unfiltered_pgn_passes() {
        let config = Config::default();
        assert!(should_process_message(&config, &message(61444, 0)));
    }

    #[test]
    fn test_source_filter_applies() {
        let mut config = Config::default();
        config.source_filter.pgn_source_map.insert(61444, 0);
        assert!(should_process_message(&config, &message(61444, 0)));
        assert!(!should_process_message(&config, &message(61444, 3)));
        assert!(should_process_message(&config, &message(65262, 3)));
    }
}
