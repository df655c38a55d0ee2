// Diesel table definitions for the progression schema.
// Kept in sync by hand with schema.rs; generated marker columns are omitted.

diesel::table! {
    progression_nodes (id) {
        id -> Integer,
        node_key -> Text,
        node_type -> Text,
        display_name -> Text,
        description -> Text,
        max_level -> Integer,
        unlock_cost -> Integer,
        tier -> Integer,
        size -> Text,
        category -> Text,
        sort_order -> Integer,
        modifier_config -> Nullable<Text>,
        feature_key -> Nullable<Text>,
        dynamic_prerequisites -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    progression_prerequisites (node_id, prerequisite_node_id) {
        node_id -> Integer,
        prerequisite_node_id -> Integer,
    }
}

diesel::table! {
    progression_unlocks (id) {
        id -> Integer,
        node_id -> Integer,
        current_level -> Integer,
        unlocked_at -> Text,
        unlocked_by -> Text,
        engagement_score -> Integer,
    }
}

diesel::table! {
    progression_voting_sessions (id) {
        id -> Integer,
        status -> Text,
        started_at -> Text,
        voting_deadline -> Text,
        ended_at -> Nullable<Text>,
        winning_option_id -> Nullable<Integer>,
    }
}

diesel::table! {
    progression_voting_options (id) {
        id -> Integer,
        session_id -> Integer,
        node_id -> Integer,
        target_level -> Integer,
        vote_count -> Integer,
        last_highest_vote_at -> Nullable<Text>,
    }
}

diesel::table! {
    progression_user_votes (user_id, session_id) {
        user_id -> Text,
        session_id -> Integer,
        option_id -> Integer,
        node_id -> Integer,
        voted_at -> Text,
    }
}

diesel::table! {
    progression_unlock_progress (id) {
        id -> Integer,
        node_id -> Nullable<Integer>,
        target_level -> Nullable<Integer>,
        contributions_accumulated -> Integer,
        started_at -> Text,
        unlocked_at -> Nullable<Text>,
        voting_session_id -> Nullable<Integer>,
        previous_progress_id -> Nullable<Integer>,
    }
}

diesel::table! {
    progression_voting (node_id, target_level) {
        node_id -> Integer,
        target_level -> Integer,
        vote_count -> Integer,
        voting_started_at -> Text,
        voting_ends_at -> Nullable<Text>,
        is_active -> Integer,
    }
}

diesel::table! {
    engagement_metrics (id) {
        id -> Integer,
        user_id -> Text,
        metric_type -> Text,
        metric_value -> Integer,
        metadata -> Nullable<Text>,
        recorded_at -> Text,
    }
}

diesel::table! {
    engagement_weights (metric_type) {
        metric_type -> Text,
        weight -> Double,
        description -> Nullable<Text>,
        updated_at -> Text,
    }
}

diesel::table! {
    progression_resets (id) {
        id -> Integer,
        reset_by -> Text,
        reason -> Text,
        nodes_reset_count -> Integer,
        engagement_score_at_reset -> Integer,
        reset_at -> Text,
    }
}

diesel::table! {
    user_progression (user_id, progression_type, progression_key) {
        user_id -> Text,
        progression_type -> Text,
        progression_key -> Text,
        unlocked_at -> Text,
        metadata -> Nullable<Text>,
    }
}

diesel::table! {
    progression_sync_metadata (config_name) {
        config_name -> Text,
        last_sync_time -> Text,
        file_hash -> Text,
        file_mod_time -> Text,
    }
}

diesel::joinable!(progression_unlocks -> progression_nodes (node_id));
diesel::joinable!(progression_voting_options -> progression_voting_sessions (session_id));
diesel::joinable!(progression_user_votes -> progression_voting_options (option_id));

diesel::allow_tables_to_appear_in_same_query!(
    progression_nodes,
    progression_prerequisites,
    progression_unlocks,
    progression_voting_sessions,
    progression_voting_options,
    progression_user_votes,
    progression_unlock_progress,
    progression_voting,
    engagement_metrics,
    engagement_weights,
    progression_resets,
    user_progression,
    progression_sync_metadata,
);
