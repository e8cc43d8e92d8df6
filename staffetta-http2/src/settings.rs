// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! SETTINGS parameters and the per-direction settings state.
//!
//! # References
//! * [RFC 9113 - Section 6.5. SETTINGS](https://httpwg.org/specs/rfc9113.html#SETTINGS)

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x00_01;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x00_02;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x00_03;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x00_04;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x00_05;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x00_06;

pub const MAXIMUM_ALLOWED_FRAME_SIZE: u32 = 0x00FF_FFFF;
pub const MAXIMUM_FLOW_CONTROL_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SettingKind {
    HeaderTableSize = SETTINGS_HEADER_TABLE_SIZE,
    EnablePush = SETTINGS_ENABLE_PUSH,
    MaxConcurrentStreams = SETTINGS_MAX_CONCURRENT_STREAMS,
    InitialWindowSize = SETTINGS_INITIAL_WINDOW_SIZE,
    MaxFrameSize = SETTINGS_MAX_FRAME_SIZE,
    MaxHeaderListSize = SETTINGS_MAX_HEADER_LIST_SIZE,
}

impl SettingKind {
    pub const fn default_value(&self) -> SettingValue {
        SettingValue(match self {
            SettingKind::HeaderTableSize => 4096,
            SettingKind::EnablePush => 1,
            SettingKind::MaxConcurrentStreams => u32::MAX,
            SettingKind::InitialWindowSize => 65535,
            SettingKind::MaxFrameSize => 16384,
            SettingKind::MaxHeaderListSize => u32::MAX,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingValue(pub u32);

/// The six RFC 7540/9113 parameters for one direction of the connection.
///
/// Two instances live on a connection: the values the peer advertised to us
/// (governing what we send) and the values we advertised to the peer
/// (governing what we accept).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: SettingKind::HeaderTableSize.default_value().0,
            enable_push: true,
            max_concurrent_streams: SettingKind::MaxConcurrentStreams.default_value().0,
            initial_window_size: SettingKind::InitialWindowSize.default_value().0,
            max_frame_size: SettingKind::MaxFrameSize.default_value().0,
            max_header_list_size: SettingKind::MaxHeaderListSize.default_value().0,
        }
    }
}

impl Settings {
    /// Apply a received parameter list. Returns the change to
    /// `INITIAL_WINDOW_SIZE`, which the caller must use to retroactively
    /// adjust the send window of every existing stream.
    ///
    /// Value validation has already happened at frame-parse time, so this
    /// cannot fail.
    ///
    /// # References
    /// * [RFC 9113 - Section 6.9.2](https://httpwg.org/specs/rfc9113.html#InitialWindowSize)
    pub fn apply(&mut self, settings: &[(SettingKind, SettingValue)]) -> i32 {
        let mut window_delta = 0;
        for (kind, value) in settings {
            match kind {
                SettingKind::HeaderTableSize => self.header_table_size = value.0,
                SettingKind::EnablePush => self.enable_push = value.0 == 1,
                SettingKind::MaxConcurrentStreams => self.max_concurrent_streams = value.0,
                SettingKind::InitialWindowSize => {
                    window_delta = value.0 as i32 - self.initial_window_size as i32;
                    self.initial_window_size = value.0;
                }
                SettingKind::MaxFrameSize => self.max_frame_size = value.0,
                SettingKind::MaxHeaderListSize => self.max_header_list_size = value.0,
            }
        }
        window_delta
    }

    /// The parameter list to announce in our initial SETTINGS frame, listing
    /// only values that differ from the protocol defaults.
    pub fn to_announcement(&self) -> Vec<(SettingKind, SettingValue)> {
        let mut settings = Vec::new();

        // Push is never supported by this server.
        settings.push((SettingKind::EnablePush, SettingValue(0)));

        if self.header_table_size != SettingKind::HeaderTableSize.default_value().0 {
            settings.push((SettingKind::HeaderTableSize, SettingValue(self.header_table_size)));
        }
        if self.max_concurrent_streams != SettingKind::MaxConcurrentStreams.default_value().0 {
            settings.push((SettingKind::MaxConcurrentStreams, SettingValue(self.max_concurrent_streams)));
        }
        if self.initial_window_size != SettingKind::InitialWindowSize.default_value().0 {
            settings.push((SettingKind::InitialWindowSize, SettingValue(self.initial_window_size)));
        }
        if self.max_frame_size != SettingKind::MaxFrameSize.default_value().0 {
            settings.push((SettingKind::MaxFrameSize, SettingValue(self.max_frame_size)));
        }
        if self.max_header_list_size != SettingKind::MaxHeaderListSize.default_value().0 {
            settings.push((SettingKind::MaxHeaderListSize, SettingValue(self.max_header_list_size)));
        }

        settings
    }
}
