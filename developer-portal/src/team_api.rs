// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{DeveloperPortalClient, PortalError, PortalRequest},
    log::info,
    serde::Deserialize,
    serde_json::json,
};

const GET_TEAMS_URL: &str =
    "https://developer.apple.com/services-account/QH65B2/account/getTeams";

#[derive(Clone, Debug, Deserialize)]
pub struct Team {
    #[serde(rename = "teamId")]
    pub team_id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    #[serde(rename = "userRoles", default)]
    pub roles: Vec<String>,
}

#[derive(Deserialize)]
struct TeamsBody {
    #[serde(default)]
    teams: Vec<Team>,
}

impl DeveloperPortalClient {
    /// All teams the authenticated Apple ID belongs to.
    pub fn list_teams(&self) -> Result<Vec<Team>, PortalError> {
        self.ensure_authenticated()?;

        let request = PortalRequest::post(GET_TEAMS_URL)
            .header("Accept", "application/json, text/javascript")
            .header("X-Requested-With", "XMLHttpRequest")
            .json(json!({ "includeInMigrationTeams": 1 }));

        let response = self.send(&request)?;
        let body = self.expect_service_ok(&response, "getTeams")?;
        let parsed: TeamsBody = serde_json::from_value(body)?;

        info!("portal reports {} team(s)", parsed.teams.len());
        Ok(parsed.teams)
    }

    /// Resolve the single active team, or fail with [PortalError::TeamAmbiguous]
    /// when the Apple ID belongs to several and no explicit id was given.
    pub fn resolve_team(&self, wanted: Option<&str>) -> Result<Team, PortalError> {
        let teams = self.list_teams()?;

        if let Some(wanted) = wanted {
            return teams
                .into_iter()
                .find(|t| t.team_id == wanted)
                .ok_or_else(|| PortalError::TeamAmbiguous(vec![wanted.to_string()]));
        }

        let mut active: Vec<Team> = teams
            .into_iter()
            .filter(|t| t.status.eq_ignore_ascii_case("active"))
            .collect();

        match active.len() {
            1 => Ok(active.remove(0)),
            0 => Err(PortalError::TeamAmbiguous(Vec::new())),
            _ => Err(PortalError::TeamAmbiguous(
                active.into_iter().map(|t| t.team_id).collect(),
            )),
        }
    }
}
