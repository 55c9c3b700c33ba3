use std::fmt;

use openssl::sha::sha1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Madrid,
    AlloySms,
    AlloyGelato,
    AlloyBiz,
    AlloySafetyMonitor,
    AlloySafetyMonitorOwnAccount,
    AlloyGameCenterIMessage,
    AlloyAskTo,
    Ids,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Madrid,
        Topic::AlloySms,
        Topic::AlloyGelato,
        Topic::AlloyBiz,
        Topic::AlloySafetyMonitor,
        Topic::AlloySafetyMonitorOwnAccount,
        Topic::AlloyGameCenterIMessage,
        Topic::AlloyAskTo,
        Topic::Ids,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Madrid => "com.apple.madrid",
            Topic::AlloySms => "com.apple.private.alloy.sms",
            Topic::AlloyGelato => "com.apple.private.alloy.gelato",
            Topic::AlloyBiz => "com.apple.private.alloy.biz",
            Topic::AlloySafetyMonitor => "com.apple.private.alloy.safetymonitor",
            Topic::AlloySafetyMonitorOwnAccount => "com.apple.private.alloy.safetymonitor.ownaccount",
            Topic::AlloyGameCenterIMessage => "com.apple.private.alloy.gamecenter.imessage",
            Topic::AlloyAskTo => "com.apple.private.alloy.askto",
            Topic::Ids => "com.apple.private.ids",
        }
    }

    /// Topic names travel as SHA-1 digests.
    pub fn hash(self) -> [u8; 20] {
        sha1(self.as_str().as_bytes())
    }

    pub fn from_hash(hash: &[u8]) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.hash() == hash)
    }

    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
