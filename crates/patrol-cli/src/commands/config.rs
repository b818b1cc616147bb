use crate::cli::ConfigCommands;
use crate::config_profiles::{GuardProfile, ProfileStore};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            store_url,
            anon_key,
            access_token,
            guard_id,
            no_activate,
        } => {
            let flags = GuardProfile {
                guard_id,
                store_url,
                anon_key,
                access_token,
            };
            // Flags first, then the `PATROL_*` environment; unset fields keep the saved value
            let update = GuardProfile::from_env().overlay(flags);
            run_config_init(global_profile, update, no_activate)
        }
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    update: GuardProfile,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut profiles = ProfileStore::load()?;
    let profile_name = profiles.resolve_name(profile_name);
    let missing_fields = profiles
        .apply(&profile_name, update, !no_activate)?
        .missing_fields();

    let path = profiles.save()?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );
    if missing_fields.is_empty() {
        println!("Profile '{profile_name}' is ready. Run `patrol shift` to check your schedule.");
    } else {
        println!(
            "Profile '{}' is missing: {}",
            profile_name,
            missing_fields.join(", ")
        );
    }

    Ok(())
}
