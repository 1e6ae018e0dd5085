use bitflags::bitflags;

bitflags! {
    /// Gateway intents: a bitmask selecting which event classes the
    /// gateway will deliver to the session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Intents: u32 {
        const GUILDS                   = 1 << 0;
        const GUILD_MEMBERS            = 1 << 1;
        const GUILD_BANS               = 1 << 2;
        const GUILD_EMOJIS             = 1 << 3;
        const GUILD_INTEGRATIONS       = 1 << 4;
        const GUILD_WEBHOOKS           = 1 << 5;
        const GUILD_INVITES            = 1 << 6;
        const GUILD_VOICE_STATES       = 1 << 7;
        const GUILD_PRESENCES          = 1 << 8;
        const GUILD_MESSAGES           = 1 << 9;
        const GUILD_MESSAGE_REACTIONS  = 1 << 10;
        const GUILD_MESSAGE_TYPING     = 1 << 11;
        const DIRECT_MESSAGES          = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING    = 1 << 14;
    }
}
