// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use codec::{random_string, QoS};

#[derive(Clone, Debug)]
pub struct HttpProxy {
    pub hostname: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub enum Proxy {
    None,
    Http(HttpProxy),
}

#[derive(Clone, Debug)]
pub struct SelfSignedTls {
    pub root_ca_pem: String,
    pub cert_pem: String,
}

#[derive(Clone, Debug)]
pub enum TlsType {
    CASigned,
    SelfSigned(SelfSignedTls),
    AllowInvalidCertificates,
}

#[derive(Clone, Debug)]
pub struct WebSocketOptions {
    pub server: String,
    pub request_headers: HashMap<String, String>,
    pub keep_alive_interval: Duration,
    pub proxy: Proxy,
}

#[derive(Clone, Debug, Default)]
pub struct LastWillAndTestament {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct UserProperties(Vec<(String, String)>);

impl UserProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn as_slice(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Full set of options recognised by the connection supervisor.
///
/// Mirrors the `ruo::connect_options::ConnectOptions` builder shape but carries every
/// field a MQTT v5 CONNECT handshake and its surrounding transport can negotiate, rather
/// than the narrower MQTT v3-era set (address/client_id/keep_alive/connect_timeout/proxy).
#[derive(Clone, Debug)]
pub struct ClientOptions {
    address: SocketAddr,
    prefer_ipv6: bool,
    client_id: String,
    clean_start: bool,
    session_expiry_interval: u32,
    keep_alive: u16,
    username: Option<String>,
    password: Option<String>,
    last_will: Option<LastWillAndTestament>,
    client_max_packet_size: Option<u32>,
    client_receive_maximum: u16,
    client_topic_alias_maximum: u16,
    request_response_information: bool,
    request_problem_information: bool,
    authentication_method: Option<String>,
    authentication_data: Vec<u8>,
    user_properties: UserProperties,
    connect_timeout: Duration,
    response_timeout: Duration,
    allow_invalid_broker_certificates: bool,
    tls: Option<TlsType>,
    web_socket: Option<WebSocketOptions>,
    proxy: Proxy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 1883)),
            prefer_ipv6: false,
            client_id: random_string(8),
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: 60,
            username: None,
            password: None,
            last_will: None,
            client_max_packet_size: None,
            client_receive_maximum: u16::MAX,
            client_topic_alias_maximum: 0,
            request_response_information: false,
            request_problem_information: true,
            authentication_method: None,
            authentication_data: Vec::new(),
            user_properties: UserProperties::new(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            allow_invalid_broker_certificates: false,
            tls: None,
            web_socket: None,
            proxy: Proxy::None,
        }
    }
}

impl ClientOptions {
    /// # Errors
    ///
    /// Returns error if `address` cannot be resolved to a socket address.
    pub fn new<A: ToSocketAddrs>(address: A) -> io::Result<Self> {
        let mut addrs = address.to_socket_addrs()?;
        let address = addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty address"))?;
        Ok(Self {
            address,
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn address(&self) -> &SocketAddr {
        &self.address
    }

    pub fn set_prefer_ipv6(&mut self, prefer_ipv6: bool) -> &mut Self {
        self.prefer_ipv6 = prefer_ipv6;
        self
    }

    #[must_use]
    pub const fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) -> &mut Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn set_session_expiry_interval(&mut self, seconds: u32) -> &mut Self {
        self.session_expiry_interval = seconds;
        self
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    /// A `keep_alive` of 0 disables the ping-request mechanism entirely.
    pub fn set_keep_alive(&mut self, seconds: u16) -> &mut Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_credentials(&mut self, username: &str, password: Option<&str>) -> &mut Self {
        self.username = Some(username.to_string());
        self.password = password.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn set_last_will(&mut self, will: LastWillAndTestament) -> &mut Self {
        self.last_will = Some(will);
        self
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWillAndTestament> {
        self.last_will.as_ref()
    }

    pub fn set_client_max_packet_size(&mut self, size: u32) -> &mut Self {
        self.client_max_packet_size = Some(size);
        self
    }

    #[must_use]
    pub const fn client_max_packet_size(&self) -> Option<u32> {
        self.client_max_packet_size
    }

    pub fn set_client_receive_maximum(&mut self, max: u16) -> &mut Self {
        self.client_receive_maximum = max;
        self
    }

    #[must_use]
    pub const fn client_receive_maximum(&self) -> u16 {
        self.client_receive_maximum
    }

    pub fn set_client_topic_alias_maximum(&mut self, max: u16) -> &mut Self {
        self.client_topic_alias_maximum = max;
        self
    }

    #[must_use]
    pub const fn client_topic_alias_maximum(&self) -> u16 {
        self.client_topic_alias_maximum
    }

    pub fn set_request_response_information(&mut self, value: bool) -> &mut Self {
        self.request_response_information = value;
        self
    }

    #[must_use]
    pub const fn request_response_information(&self) -> bool {
        self.request_response_information
    }

    pub fn set_request_problem_information(&mut self, value: bool) -> &mut Self {
        self.request_problem_information = value;
        self
    }

    #[must_use]
    pub const fn request_problem_information(&self) -> bool {
        self.request_problem_information
    }

    pub fn set_authentication(&mut self, method: impl Into<String>, data: Vec<u8>) -> &mut Self {
        self.authentication_method = Some(method.into());
        self.authentication_data = data;
        self
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        self.authentication_method.as_deref()
    }

    #[must_use]
    pub fn authentication_data(&self) -> &[u8] {
        &self.authentication_data
    }

    #[must_use]
    pub const fn user_properties(&self) -> &UserProperties {
        &self.user_properties
    }

    pub fn user_properties_mut(&mut self) -> &mut UserProperties {
        &mut self.user_properties
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn set_allow_invalid_broker_certificates(&mut self, allow: bool) -> &mut Self {
        self.allow_invalid_broker_certificates = allow;
        self
    }

    #[must_use]
    pub const fn allow_invalid_broker_certificates(&self) -> bool {
        self.allow_invalid_broker_certificates
    }

    pub fn set_tls(&mut self, tls: TlsType) -> &mut Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn tls(&self) -> Option<&TlsType> {
        self.tls.as_ref()
    }

    pub fn set_web_socket(&mut self, web_socket: WebSocketOptions) -> &mut Self {
        self.web_socket = Some(web_socket);
        self
    }

    #[must_use]
    pub const fn web_socket(&self) -> Option<&WebSocketOptions> {
        self.web_socket.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: Proxy) -> &mut Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub const fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_id_is_nonempty() {
        let options = ClientOptions::default();
        assert_eq!(options.client_id().len(), 8);
    }

    #[test]
    fn test_keep_alive_zero_is_allowed() {
        let mut options = ClientOptions::default();
        options.set_keep_alive(0);
        assert_eq!(options.keep_alive(), 0);
    }
}
