use tollgate_db::DemoSeedDataset;

use crate::commands::{load_config, migrated_pool, runtime, CommandResult, StepError};

pub fn run(clean: bool) -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;

        if clean {
            let outcome = DemoSeedDataset::clean(&pool)
                .await
                .map(|()| "demo dataset removed".to_string())
                .map_err(|error| ("seed_execution", error.to_string(), 5u8));
            pool.close().await;
            return outcome;
        }

        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<String, StepError> = if verification.all_present {
            Ok(format!(
                "demo dataset ready: {} directory users, hierarchy `{}` ({})",
                seed_result.users_seeded,
                seed_result.hierarchy_id,
                if seed_result.hierarchy_created { "created" } else { "already present" }
            ))
        } else {
            Err(("seed_verification", verification_message(&verification.checks), 6u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(message) => CommandResult::success("seed", message),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn verification_message(checks: &[(&'static str, bool)]) -> String {
    let failed_checks =
        checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = [
            ("directory-users", true),
            ("standard-po-levels", false),
            ("standard-po-default", false),
        ];

        assert_eq!(
            verification_message(&checks),
            "Seed verification failed for checks: standard-po-levels, standard-po-default"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = [("directory-users", true)];
        assert_eq!(verification_message(&checks), "Some seed data failed to load");
    }
}
