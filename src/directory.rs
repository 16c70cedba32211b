//! User and group lookups. Membership management lives elsewhere; the
//! registry only reads from it.

use callcore::types::{GroupId, UserId};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub name: String,
    pub members: Vec<Member>,
}

pub trait Directory: Send + Sync {
    fn user(&self, user: &UserId) -> Option<Member>;

    fn group(&self, group: &GroupId) -> Option<GroupInfo>;
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, Member>,
    groups: DashMap<GroupId, GroupInfo>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: impl Into<UserId>, display_name: impl Into<String>) -> Member {
        let member = Member {
            user_id: id.into(),
            display_name: display_name.into(),
        };
        self.users.insert(member.user_id.clone(), member.clone());
        member
    }

    /// Members must already be registered users; unknown ids are skipped.
    pub fn add_group(&self, id: impl Into<GroupId>, name: impl Into<String>, members: &[&str]) {
        let group_id = id.into();
        let members = members
            .iter()
            .filter_map(|m| self.user(&UserId::new(*m)))
            .collect();
        self.groups.insert(
            group_id.clone(),
            GroupInfo {
                group_id,
                name: name.into(),
                members,
            },
        );
    }
}

impl Directory for InMemoryDirectory {
    fn user(&self, user: &UserId) -> Option<Member> {
        self.users.get(user).map(|m| m.clone())
    }

    fn group(&self, group: &GroupId) -> Option<GroupInfo> {
        self.groups.get(group).map(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_members_resolve_display_names() {
        let dir = InMemoryDirectory::new();
        dir.add_user("alice", "Alice");
        dir.add_user("bob", "Bob");
        dir.add_group("g1", "Team", &["alice", "bob", "ghost"]);

        let group = dir.group(&GroupId::new("g1")).unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.members[1].display_name, "Bob");
        assert!(dir.user(&UserId::new("ghost")).is_none());
    }
}
