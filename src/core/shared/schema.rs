diesel::table! {
    users (id) {
        id -> Int8,
        username -> Varchar,
        email -> Varchar,
        first_name -> Varchar,
        last_name -> Varchar,
        is_staff -> Bool,
        is_active -> Bool,
        location -> Nullable<Varchar>,
        person_id -> Nullable<Varchar>,
    }
}

diesel::table! {
    user_groups (user_id, group_name) {
        user_id -> Int8,
        group_name -> Varchar,
    }
}

diesel::table! {
    environments (id) {
        id -> Int8,
        owner_id -> Int8,
        name -> Varchar,
        asset_number -> Varchar,
    }
}

diesel::table! {
    areas (id) {
        id -> Int8,
        owner_id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    tickets (id) {
        id -> Int8,
        owner_id -> Int8,
        external_id -> Nullable<Varchar>,
        summary -> Varchar,
        description -> Text,
        status -> Varchar,
        priority -> Nullable<Int2>,
        environment_id -> Nullable<Int8>,
        area_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_interactions (id) {
        id -> Int8,
        ticket_id -> Int8,
        author_id -> Int8,
        body -> Text,
        attachment_name -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notifications (id) {
        id -> Int8,
        recipient_id -> Int8,
        ticket_id -> Nullable<Int8>,
        kind -> Varchar,
        title -> Varchar,
        preview -> Varchar,
        link -> Varchar,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(user_groups -> users (user_id));
diesel::joinable!(environments -> users (owner_id));
diesel::joinable!(areas -> users (owner_id));
diesel::joinable!(tickets -> users (owner_id));
diesel::joinable!(tickets -> environments (environment_id));
diesel::joinable!(tickets -> areas (area_id));
diesel::joinable!(ticket_interactions -> tickets (ticket_id));
diesel::joinable!(ticket_interactions -> users (author_id));
diesel::joinable!(notifications -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    user_groups,
    environments,
    areas,
    tickets,
    ticket_interactions,
    notifications,
);
