use anyhow::Result;
use serenity::all::{
    Cache, ChannelId, ChannelType, Colour, CreateEmbed, CreateMessage, EditMessage, GuildChannel,
    GuildId, Http, MessageId, PermissionOverwriteType, Permissions, RoleId,
};
use serenity::async_trait;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::Arc;

use crate::pumpkin::Announcer;

pub const EMBED_COLOUR: Colour = Colour::new(0xE67E22);
pub const GHOST_COLOUR: Colour = Colour::new(0x9B59B6);
pub const HAUNTED_COLOUR: Colour = Colour::new(0xF39C12);

pub fn embed(description: impl Into<String>) -> CreateEmbed {
    CreateEmbed::new()
        .colour(EMBED_COLOUR)
        .description(description)
}

/// Posts and edits pumpkin announcements through the HTTP client.
pub struct ChannelAnnouncer {
    http: Arc<Http>,
}

impl ChannelAnnouncer {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Announcer for ChannelAnnouncer {
    async fn announce_spawn(&self, channel_id: u64, candy_amount: i64) -> Result<u64> {
        let channel_id = ChannelId::new(channel_id);
        let announcement = embed(format!(
            "👀 **A wild pumpkin has appeared in <#{}>!** Type `!grab` fast to catch it and win **{} candies**! 🎃",
            channel_id, candy_amount
        ));

        let message = channel_id
            .send_message(&self.http, CreateMessage::new().embed(announcement))
            .await?;

        Ok(message.id.get())
    }

    async fn announce_missed(&self, channel_id: u64, message_id: u64) -> Result<()> {
        ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                MessageId::new(message_id),
                EditMessage::new().embed(embed("💨 **Too slow! The pumpkin rolled away...**")),
            )
            .await?;

        Ok(())
    }
}

/// Applies channel overwrites in order (each one as `(allow, deny)`) and
/// checks the result allows viewing and posting.
pub fn can_send_after_overwrites(base: Permissions, overwrites: &[(Permissions, Permissions)]) -> bool {
    if base.administrator() {
        return true;
    }

    let mut permissions = base;
    for (allow, deny) in overwrites {
        permissions = (permissions & !*deny) | *allow;
    }

    permissions.view_channel() && permissions.send_messages()
}

/// Role-targeted overwrites on `channel` as `(role, allow, deny)`.
fn role_overwrites(channel: &GuildChannel) -> Vec<(RoleId, Permissions, Permissions)> {
    channel
        .permission_overwrites
        .iter()
        .filter_map(|overwrite| match overwrite.kind {
            PermissionOverwriteType::Role(role_id) => {
                Some((role_id, overwrite.allow, overwrite.deny))
            }
            _ => None,
        })
        .collect()
}

/// Whether members holding `role_id` (plus @everyone) can post in a channel
/// with the given role overwrites. A role missing from `roles` cannot post.
pub fn role_can_send(
    roles: &HashMap<RoleId, Permissions>,
    overwrites: &[(RoleId, Permissions, Permissions)],
    everyone_id: RoleId,
    role_id: RoleId,
) -> bool {
    let mut base = roles
        .get(&everyone_id)
        .copied()
        .unwrap_or_else(Permissions::empty);

    if role_id != everyone_id {
        match roles.get(&role_id) {
            Some(permissions) => base |= *permissions,
            None => return false,
        }
    }

    let overwrite_for = |target: RoleId| {
        overwrites
            .iter()
            .find(|(id, _, _)| *id == target)
            .map(|(_, allow, deny)| (*allow, *deny))
    };

    let mut applied = Vec::new();
    if let Some(overwrite) = overwrite_for(everyone_id) {
        applied.push(overwrite);
    }
    if role_id != everyone_id {
        if let Some(overwrite) = overwrite_for(role_id) {
            applied.push(overwrite);
        }
    }

    can_send_after_overwrites(base, &applied)
}

/// Text and announcement channels can hold a spawn.
pub fn is_spawnable_kind(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Text | ChannelType::News)
}

/// Channels where a pumpkin may spawn: the bot and @everyone can post,
/// the restricted role (when configured and present) cannot, and the guild
/// is not disabled. `only_guild` narrows the search to one guild.
pub fn eligible_channels(
    cache: &Cache,
    disabled_guilds: &HashSet<u64>,
    restricted_role_id: Option<u64>,
    only_guild: Option<GuildId>,
) -> Vec<u64> {
    let bot_id = cache.current_user().id;
    let restricted_role_id = restricted_role_id
        .and_then(NonZeroU64::new)
        .map(|id| RoleId::new(id.get()));
    let mut channels = Vec::new();

    for guild_id in cache.guilds() {
        if disabled_guilds.contains(&guild_id.get()) {
            continue;
        }
        if only_guild.is_some_and(|only| only != guild_id) {
            continue;
        }

        let Some(guild) = cache.guild(guild_id) else {
            continue;
        };
        let Some(bot_member) = guild.members.get(&bot_id) else {
            continue;
        };
        let everyone_id = RoleId::new(guild_id.get());
        let roles: HashMap<RoleId, Permissions> = guild
            .roles
            .iter()
            .map(|(id, role)| (*id, role.permissions))
            .collect();
        let restricted = restricted_role_id.filter(|role_id| roles.contains_key(role_id));

        for channel in guild.channels.values() {
            if !is_spawnable_kind(channel.kind) {
                continue;
            }
            if !guild.user_permissions_in(channel, bot_member).send_messages() {
                continue;
            }
            let overwrites = role_overwrites(channel);
            if !role_can_send(&roles, &overwrites, everyone_id, everyone_id) {
                continue;
            }
            if restricted
                .is_some_and(|role_id| role_can_send(&roles, &overwrites, everyone_id, role_id))
            {
                continue;
            }
            channels.push(channel.id.get());
        }
    }

    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send() -> Permissions {
        Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES
    }

    #[test]
    fn base_permissions_apply_without_overwrites() {
        assert!(can_send_after_overwrites(send(), &[]));
        assert!(!can_send_after_overwrites(Permissions::VIEW_CHANNEL, &[]));
    }

    #[test]
    fn everyone_deny_blocks_posting() {
        let everyone_deny = (Permissions::empty(), Permissions::SEND_MESSAGES);
        assert!(!can_send_after_overwrites(send(), &[everyone_deny]));
    }

    #[test]
    fn later_role_overwrite_wins() {
        let everyone_deny = (Permissions::empty(), Permissions::SEND_MESSAGES);
        let role_allow = (Permissions::SEND_MESSAGES, Permissions::empty());
        assert!(can_send_after_overwrites(send(), &[everyone_deny, role_allow]));
        assert!(!can_send_after_overwrites(send(), &[role_allow, everyone_deny]));
    }

    #[test]
    fn administrators_ignore_overwrites() {
        let deny_all = (Permissions::empty(), send());
        assert!(can_send_after_overwrites(
            Permissions::ADMINISTRATOR,
            &[deny_all]
        ));
    }

    fn everyone() -> RoleId {
        RoleId::new(100)
    }

    fn restricted() -> RoleId {
        RoleId::new(200)
    }

    fn roles(restricted_permissions: Permissions) -> HashMap<RoleId, Permissions> {
        HashMap::from([(everyone(), send()), (restricted(), restricted_permissions)])
    }

    #[test]
    fn everyone_role_uses_its_base_and_overwrite() {
        let roles = roles(Permissions::empty());
        assert!(role_can_send(&roles, &[], everyone(), everyone()));

        let deny = [(everyone(), Permissions::empty(), Permissions::SEND_MESSAGES)];
        assert!(!role_can_send(&roles, &deny, everyone(), everyone()));

        // Without an @everyone role entry the base is empty.
        assert!(!role_can_send(&HashMap::new(), &[], everyone(), everyone()));
    }

    #[test]
    fn restricted_role_needs_its_own_overwrite_past_an_everyone_deny() {
        let everyone_deny = (everyone(), Permissions::empty(), Permissions::SEND_MESSAGES);
        let roles = roles(Permissions::SEND_MESSAGES);

        assert!(!role_can_send(&roles, &[everyone_deny], everyone(), restricted()));

        let restricted_allow = (restricted(), Permissions::SEND_MESSAGES, Permissions::empty());
        assert!(role_can_send(
            &roles,
            &[restricted_allow, everyone_deny],
            everyone(),
            restricted()
        ));
    }

    #[test]
    fn administrator_role_posts_through_an_everyone_deny() {
        let everyone_deny = (everyone(), Permissions::empty(), Permissions::SEND_MESSAGES);
        let roles = roles(Permissions::ADMINISTRATOR);
        assert!(role_can_send(&roles, &[everyone_deny], everyone(), restricted()));
        assert!(!role_can_send(&roles, &[everyone_deny], everyone(), everyone()));
    }

    #[test]
    fn missing_role_cannot_post() {
        let roles = HashMap::from([(everyone(), send())]);
        assert!(!role_can_send(&roles, &[], everyone(), restricted()));
    }

    #[test]
    fn announcement_channels_can_hold_a_spawn() {
        assert!(is_spawnable_kind(ChannelType::Text));
        assert!(is_spawnable_kind(ChannelType::News));
        assert!(!is_spawnable_kind(ChannelType::Voice));
        assert!(!is_spawnable_kind(ChannelType::Category));
    }

    #[test]
    fn hidden_channel_is_not_postable() {
        let hide = (Permissions::empty(), Permissions::VIEW_CHANNEL);
        assert!(!can_send_after_overwrites(send(), &[hide]));
    }
}
