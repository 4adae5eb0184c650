use std::collections::HashMap;

/// The message being assembled on a session. Each field keeps the last
/// value the protocol engine reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: String,
    pub data: String,
}

/// Everything the delivery engine needs for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    /// Address the connection was accepted on. Outbound mail leaves from it.
    pub local_address: String,
    /// Identity announced for the message, after `map_ip` translation.
    pub sending_address: String,
    pub mail_from: String,
    pub rcpt_to: String,
    pub data: String,
}

impl DeliveryRequest {
    pub fn build(
        local_address: &str,
        envelope: &Envelope,
        map_ip: &HashMap<String, String>,
    ) -> Self {
        let sending_address = map_ip
            .get(local_address)
            .cloned()
            .unwrap_or_else(|| local_address.to_string());

        Self {
            local_address: local_address.to_string(),
            sending_address,
            mail_from: envelope.mail_from.clone(),
            rcpt_to: envelope.rcpt_to.clone(),
            data: envelope.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            mail_from: "app@example.net".to_string(),
            rcpt_to: "user@example.org".to_string(),
            data: "Subject: hi\r\n\r\nhello\r\n".to_string(),
        }
    }

    fn remap() -> HashMap<String, String> {
        HashMap::from([("10.0.0.5".to_string(), "203.0.113.9".to_string())])
    }

    #[test]
    fn remaps_known_local_address() {
        let request = DeliveryRequest::build("10.0.0.5", &envelope(), &remap());

        assert_eq!(request.local_address, "10.0.0.5");
        assert_eq!(request.sending_address, "203.0.113.9");
        assert_eq!(request.mail_from, "app@example.net");
        assert_eq!(request.rcpt_to, "user@example.org");
        assert_eq!(request.data, "Subject: hi\r\n\r\nhello\r\n");
    }

    #[test]
    fn unknown_local_address_is_used_verbatim() {
        let request = DeliveryRequest::build("10.0.0.1", &envelope(), &remap());
        assert_eq!(request.local_address, "10.0.0.1");
        assert_eq!(request.sending_address, "10.0.0.1");
    }

    #[test]
    fn same_inputs_build_same_request() {
        let env = envelope();
        let map = remap();
        assert_eq!(
            DeliveryRequest::build("10.0.0.5", &env, &map),
            DeliveryRequest::build("10.0.0.5", &env, &map)
        );
    }
}
